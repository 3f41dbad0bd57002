//! Central capture of fatal process signals.
//!
//! Signals are never handled inside user hooks: the handler only records
//! which signal arrived, and the controller thread polls for it, turning
//! it into a graceful end-of-state-machine request. All blocking core
//! waits then return `interrupted`.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, Ordering};

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Install the SIGINT/SIGTERM handler for this process.
pub fn install() -> std::io::Result<()> {
    let action = SigAction::new(SigHandler::Handler(record), SaFlags::empty(), SigSet::empty());
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(sig, &action) }
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    }
    Ok(())
}

/// The last fatal signal delivered, if any.
pub fn pending() -> Option<i32> {
    match LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signum => Some(signum),
    }
}

/// Forget a recorded signal (test support).
pub fn reset() {
    LAST_SIGNAL.store(0, Ordering::SeqCst);
}
