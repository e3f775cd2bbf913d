//! Platform-specific process helpers

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

#[cfg(not(any(unix, windows)))]
mod fallback {
    use std::process::Command;

    pub fn prepare_command(_cmd: &mut Command) -> std::io::Result<()> {
        Ok(())
    }

    /// Without a liveness probe every process is assumed alive, so a
    /// recorded leader is never reclaimed.
    pub fn process_alive(_pid: u32) -> bool {
        true
    }
}
#[cfg(not(any(unix, windows)))]
pub use fallback::*;

/// Id of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}
