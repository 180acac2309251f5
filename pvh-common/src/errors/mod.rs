//! Error catalog and shared error traits.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors           |
//! | E100-E199  | Repository  | Mirror and working-copy errors           |
//! | E200-E299  | Sandbox     | Patch application and execution errors   |
//! | E300-E399  | Resolution  | Test target and verdict derivation       |
//! | E400-E499  | Worker      | Scheduling, capacity and health          |
//! | E500-E599  | Internal    | Internal/unexpected errors               |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether a later attempt (possibly elsewhere) may succeed.
    fn is_retryable(&self) -> bool;

    /// Catalog code for records and HTTP bodies.
    fn code(&self) -> ErrorCode;
}
