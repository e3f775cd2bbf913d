use std::io;
use std::process::Command;

/// Prepares a copy process before exec.
///
/// Copies get their own process group so a Ctrl-C aimed at the interactive
/// MAIN does not interrupt them inside their critical window. No parent-death
/// signal is set: copies are fire-and-forget and must always detach.
pub fn prepare_command(cmd: &mut Command) -> io::Result<()> {
    use std::os::unix::process::CommandExt;

    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    Ok(())
}

/// Check if process is alive
pub fn process_alive(pid: u32) -> bool {
    let Ok(c_pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if c_pid <= 0 {
        return false;
    }
    match send_signal(c_pid, 0) {
        Ok(_) => true,                      // Signal sent successfully, process exists
        Err(errno) => errno == libc::EPERM, // EPERM means process exists but no permission
    }
}

/// Encapsulates unsafe setpgid call
unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

/// Encapsulates unsafe kill call and returns Result instead of raw error code
fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<(), libc::c_int> {
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}
