//! Signal plumbing for the dispatcher.
//!
//! Handlers only flip atomics and set the dispatcher's latch; all real work
//! happens back in the main loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use hagent_net::Latch;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static WAKE_LATCH: OnceLock<Arc<Latch>> = OnceLock::new();

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    wake();
}

extern "C" fn on_child(_: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
    wake();
}

fn wake() {
    if let Some(latch) = WAKE_LATCH.get() {
        latch.set();
    }
}

fn set_disposition(sig: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handlers above only store to atomics and call Latch::set,
    // which is async-signal-safe.
    unsafe { signal::sigaction(sig, &action) }
        .with_context(|| format!("Failed to install handler for {sig}"))?;
    Ok(())
}

/// Install the daemon's handlers. `latch` is set whenever a handler runs.
///
/// Only the first latch passed in is used; the daemon installs once.
pub fn install(latch: Arc<Latch>) -> Result<()> {
    let _ = WAKE_LATCH.set(latch);
    set_disposition(Signal::SIGTERM, SigHandler::Handler(on_shutdown))?;
    set_disposition(Signal::SIGINT, SigHandler::Handler(on_shutdown))?;
    set_disposition(Signal::SIGCHLD, SigHandler::Handler(on_child))?;
    // Writes to a vanished client must fail with EPIPE, not kill us.
    set_disposition(Signal::SIGPIPE, SigHandler::SigIgn)?;
    Ok(())
}

/// Undo [`install`] in a freshly forked worker. SIGPIPE stays ignored.
pub fn restore_defaults() -> Result<()> {
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGCHLD] {
        set_disposition(sig, SigHandler::SigDfl)?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Ask the dispatcher to stop, as SIGTERM would.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    wake();
}

/// True if SIGCHLD arrived since the last call.
pub fn take_child_exited() -> bool {
    CHILD_EXITED.swap(false, Ordering::SeqCst)
}
