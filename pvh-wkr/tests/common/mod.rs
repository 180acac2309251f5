pub mod git;
pub mod logging;

pub use git::{SourceRepo, git_available};
pub use logging::init_test_logging;
