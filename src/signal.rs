//! Termination signals become a cooperative stop request.
//!
//! SIGINT/SIGTERM (Ctrl-C/Ctrl-Break/close on Windows) only set a flag; the
//! MAIN session polls it and runs the same shutdown path as the `exit`
//! command, so the segment is always detached.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether a termination signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

pub fn install() -> io::Result<()> {
    #[cfg(unix)]
    {
        setup_unix_signal_handlers()?;
    }

    #[cfg(windows)]
    {
        setup_windows_signal_handler()?;
    }

    Ok(())
}

#[cfg(unix)]
fn setup_unix_signal_handlers() -> io::Result<()> {
    use std::sync::Once;

    static INIT: Once = Once::new();
    let mut result = Ok(());

    INIT.call_once(|| {
        result = unsafe { setup_signal_handlers_safe() };
    });

    result
}

#[cfg(unix)]
/// Installs the handlers with `sigaction`
unsafe fn setup_signal_handlers_safe() -> io::Result<()> {
    extern "C" fn handler(_signum: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();

        // Set SA_RESTART flag to avoid interrupted system calls
        action.sa_flags = libc::SA_RESTART;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask as *mut libc::sigset_t);

        for signum in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

#[cfg(windows)]
fn setup_windows_signal_handler() -> io::Result<()> {
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::System::Console::{
        SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT,
    };

    unsafe extern "system" fn handler(ctrl_type: u32) -> BOOL {
        match ctrl_type {
            CTRL_C_EVENT | CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT => {
                SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
                BOOL(1)
            }
            _ => BOOL(0),
        }
    }

    unsafe { SetConsoleCtrlHandler(Some(handler), true) }
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}
