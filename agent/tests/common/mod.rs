use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::CommandCargoExt;

pub const AGENT_BIN: &str = "yamc-agent";

/// Constructs a `Command` that executes the agent in `workdir`.
///
/// This does NOT call `cargo run`, see [`assert_cmd::Command::cargo_bin`].
pub fn agent_command(bin_args: &[&str], workdir: &Path) -> Command {
    let mut cmd = Command::cargo_bin(AGENT_BIN).expect("the agent binary should be built by cargo test");
    cmd.args(bin_args).current_dir(workdir).env_remove("YAMC_CONFIG");
    cmd
}

/// Runs the agent until it exits, and captures its output.
pub fn run_agent(bin_args: &[&str], workdir: &Path) -> Output {
    let mut cmd = agent_command(bin_args, workdir);
    let output = cmd.output().unwrap_or_else(|e| panic!("could not run {cmd:?}: {e}"));
    // shown by the test harness on failure
    println!("stdout:\n{}", String::from_utf8_lossy(&output.stdout));
    println!("stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    output
}

/// Starts the agent in the background. Its output is discarded.
pub fn spawn_agent(bin_args: &[&str], workdir: &Path) -> ChildGuard {
    let mut cmd = agent_command(bin_args, workdir);
    let child = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap_or_else(|e| panic!("could not spawn {cmd:?}: {e}"));
    ChildGuard(Some(child))
}

/// Polls `condition` until it returns `true` or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// A child process that is killed on drop, if it is still running.
pub struct ChildGuard(Option<Child>);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
        }
    }
}

impl Deref for ChildGuard {
    type Target = Child;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref().unwrap()
    }
}

impl DerefMut for ChildGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut().unwrap()
    }
}
