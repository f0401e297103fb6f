//! Cooperative cancellation on SIGINT/SIGTERM.
//!
//! The handler only flips an atomic flag. Long-running loops poll
//! [`check`], which returns [`RemasterError::Interrupted`] and unwinds
//! through any live [`crate::mount::MountSession`], whose `Drop` releases
//! the mount and loop device.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{RemasterError, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT and SIGTERM handlers.
pub fn install_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with `Interrupted` once a signal has been received.
pub fn check() -> Result<()> {
    if is_interrupted() {
        return Err(RemasterError::Interrupted);
    }
    Ok(())
}
