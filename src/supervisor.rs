//! Launching copy processes
//!
//! The copy spawner treats process creation as a black box:
//! `spawn(path, args) -> (pid, status)`. Launches are fire-and-forget; the
//! spawner never waits for a copy to finish, it only reaps copies that
//! already exited so they do not linger as zombies.

use crate::platform;
use parking_lot::Mutex;
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Result of one launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnOutcome {
    pub pid: Option<u32>,
    /// 0 on success, otherwise the OS error code (or -1 when unknown).
    pub status: i32,
}

impl SpawnOutcome {
    pub fn launched(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            status: 0,
        }
    }

    pub fn failed(status: i32) -> Self {
        Self { pid: None, status }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, program: &Path, args: &[String]) -> SpawnOutcome;

    /// Collects exit statuses of finished children. Returns how many were reaped.
    fn reap(&self) -> usize {
        0
    }
}

/// Spawns real OS processes with `std::process::Command`.
#[derive(Debug, Default)]
pub struct CommandSpawner {
    env: Vec<(String, String)>,
    children: Mutex<Vec<Child>>,
}

impl CommandSpawner {
    pub fn new(env: Vec<(String, String)>) -> Self {
        Self {
            env,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Children launched and not yet reaped.
    pub fn pending(&self) -> usize {
        self.children.lock().len()
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, program: &Path, args: &[String]) -> SpawnOutcome {
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        if let Err(err) = platform::prepare_command(&mut command) {
            return SpawnOutcome::failed(err.raw_os_error().unwrap_or(-1));
        }

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                tracing::debug!(pid, program = %program.display(), ?args, "spawned copy");
                self.children.lock().push(child);
                SpawnOutcome::launched(pid)
            }
            Err(err) => {
                tracing::warn!(program = %program.display(), "failed to spawn copy: {err}");
                SpawnOutcome::failed(err.raw_os_error().unwrap_or(-1))
            }
        }
    }

    fn reap(&self) -> usize {
        let mut children = self.children.lock();
        let before = children.len();
        children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = child.id(), %status, "copy exited");
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(pid = child.id(), "failed to poll copy: {err}");
                false
            }
        });
        before - children.len()
    }
}
