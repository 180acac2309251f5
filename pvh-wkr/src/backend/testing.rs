//! Scripted in-memory backend for executor and server tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pvh_common::adapter::Invocation;
use pvh_common::config::BackendKind;

use super::{CommandOutput, PrepareRequest, Sandbox, SandboxBackend, SandboxError, SandboxLocation};

pub(crate) const TEST_PATCH: &str = "\
diff --git a/tests/test_calc.py b/tests/test_calc.py
--- a/tests/test_calc.py
+++ b/tests/test_calc.py
@@ -1,2 +1,5 @@ import calc
 def test_add():
     assert calc.add(1, 2) == 3
+
+def test_sub():
+    assert calc.sub(3, 2) == 1
";

pub(crate) const PASSING_OUTPUT: &str = "\
collected 1 item

tests/test_calc.py::test_sub PASSED                                      [100%]

============================== 1 passed in 0.05s ===============================
";

/// Records what the executor asked of it and replays canned command output
/// in order.
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub outputs: Mutex<Vec<CommandOutput>>,
    pub reject_patch: bool,
    pub fail_prepare: bool,
    pub hang: bool,
    pub files: Vec<String>,
    pub listing: Vec<String>,
    pub prepared: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub installs: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<Vec<String>>>,
}

impl FakeBackend {
    pub fn with_outputs(outputs: &[(i32, &str)]) -> Self {
        Self {
            outputs: Mutex::new(
                outputs
                    .iter()
                    .rev()
                    .map(|(code, text)| CommandOutput {
                        exit_code: Some(*code),
                        output: (*text).to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

impl SandboxBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<Sandbox, SandboxError> {
        if self.fail_prepare {
            return Err(SandboxError::Runtime("docker daemon not running".into()));
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(Sandbox {
            instance_id: request.instance_id.clone(),
            location: SandboxLocation::Container {
                name: "fake".into(),
                workdir: "/testbed".into(),
            },
        })
    }

    async fn apply_patch(&self, _sandbox: &Sandbox, _patch: &str) -> Result<(), SandboxError> {
        if self.reject_patch {
            Err(SandboxError::PatchRejected("patch does not apply".into()))
        } else {
            Ok(())
        }
    }

    async fn list_files(&self, _sandbox: &Sandbox, _dir: &str) -> Result<Vec<String>, SandboxError> {
        Ok(self.listing.clone())
    }

    async fn file_exists(&self, _sandbox: &Sandbox, path: &str) -> Result<bool, SandboxError> {
        Ok(self.files.iter().any(|f| f == path))
    }

    async fn run(
        &self,
        _sandbox: &Sandbox,
        invocation: &Invocation,
    ) -> Result<CommandOutput, SandboxError> {
        self.commands
            .lock()
            .unwrap()
            .push(invocation.argv.clone());
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let next = self.outputs.lock().unwrap().pop();
        Ok(next.unwrap_or_default())
    }

    async fn install_package(
        &self,
        _sandbox: &Sandbox,
        package: &str,
    ) -> Result<CommandOutput, SandboxError> {
        self.installs.lock().unwrap().push(package.to_string());
        Ok(CommandOutput {
            exit_code: Some(0),
            output: String::new(),
        })
    }

    async fn destroy(&self, _sandbox: &Sandbox) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
