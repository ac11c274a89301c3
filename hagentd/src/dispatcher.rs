//! Accept loop: one process owns the listening sockets and forks a worker
//! per connection.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use anyhow::{Context, Result};
use hagent_net::{Accepted, EventSet, Interest, Latch, ListeningSocket, WaitEvent};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::components::Services;
use crate::{signals, worker};

/// Stands in for a listener index on the latch registration.
const LATCH_USER_DATA: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    ShuttingDown,
}

pub struct Dispatcher {
    listeners: Vec<ListeningSocket>,
    events: Option<EventSet>,
    latch: Arc<Latch>,
    services: Services,
    max_parameter_length: usize,
    state: DispatcherState,
    forked: u64,
}

impl Dispatcher {
    /// Register `latch` and every listener in a fresh event set.
    pub fn new(
        listeners: Vec<ListeningSocket>,
        latch: Arc<Latch>,
        services: Services,
        max_parameter_length: usize,
    ) -> Result<Self> {
        let mut events = EventSet::new(listeners.len() + 1)
            .context("Failed to create event set for listening sockets")?;
        events
            .add_event(Interest::LATCH_SET, None, Some(latch.clone()), LATCH_USER_DATA)
            .context("Failed to register dispatcher latch")?;
        for (index, listener) in listeners.iter().enumerate() {
            events
                .add_event(Interest::SOCKET_ACCEPT, Some(listener.as_raw_fd()), None, index)
                .with_context(|| format!("Failed to register listener {}", listener.address()))?;
        }
        debug!(backend = ?events.backend_kind(), sockets = listeners.len(), "dispatcher ready");

        Ok(Self {
            listeners,
            events: Some(events),
            latch,
            services,
            max_parameter_length,
            state: DispatcherState::Running,
            forked: 0,
        })
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Serve until a shutdown signal arrives, then release the sockets.
    pub fn run(mut self) -> Result<()> {
        for listener in &self.listeners {
            info!(address = %listener.address(), "listening");
        }
        let result = self.accept_loop();
        self.shutdown();
        result
    }

    fn accept_loop(&mut self) -> Result<()> {
        let mut occurred: Vec<WaitEvent> = Vec::with_capacity(self.listeners.len() + 1);

        while self.state == DispatcherState::Running {
            self.latch.reset();
            if signals::shutdown_requested() {
                info!(workers_started = self.forked, "shutdown requested");
                self.state = DispatcherState::ShuttingDown;
                break;
            }
            if signals::take_child_exited() {
                reap_workers();
            }

            let events = self
                .events
                .as_mut()
                .context("Event set released while dispatcher is running")?;
            let max = events.len();
            events
                .wait(None, &mut occurred, max)
                .context("Failed to wait for connections")?;

            for event in &occurred {
                if event.events.contains(Interest::SOCKET_ACCEPT) {
                    self.accept_pending(event.user_data);
                }
            }
        }
        Ok(())
    }

    /// Accept everything queued on one listener.
    fn accept_pending(&mut self, index: usize) {
        loop {
            let Some(listener) = self.listeners.get(index) else {
                return;
            };
            match listener.accept() {
                Ok(Some(accepted)) => self.start_worker(accepted),
                Ok(None) => return,
                Err(err) => {
                    warn!(address = %listener.address(), "could not accept new connection: {}", err);
                    return;
                }
            }
        }
    }

    fn start_worker(&mut self, accepted: Accepted) {
        let peer = accepted.peer.clone();
        // SAFETY: the dispatcher is single-threaded, and the child only runs
        // the worker before exiting.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => self.become_worker(accepted),
            Ok(ForkResult::Parent { child }) => {
                // The worker has its own copy; keeping ours would hide the
                // peer's disconnect from it.
                drop(accepted);
                self.forked += 1;
                debug!(pid = child.as_raw(), %peer, "started worker");
            }
            Err(err) => {
                drop(accepted);
                warn!(%peer, "could not fork new process for connection: {}", err);
            }
        }
    }

    fn become_worker(&mut self, accepted: Accepted) -> ! {
        if let Err(err) = signals::restore_defaults() {
            warn!("could not reset signal handlers in worker: {:#}", err);
        }
        // Close the inherited multiplexer and listeners. Dropping a listener
        // never unlinks its socket file.
        self.events = None;
        self.listeners.clear();

        let code = worker::serve(accepted, &self.services, self.max_parameter_length);
        std::process::exit(code)
    }

    fn shutdown(&mut self) {
        self.state = DispatcherState::ShuttingDown;
        self.events = None;
        for listener in self.listeners.drain(..) {
            listener.remove_socket_file();
            debug!(address = %listener.address(), "closed listening socket");
        }
        info!("dispatcher stopped");
    }
}

/// Collect every exited worker without blocking.
fn reap_workers() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, 0)) => {
                debug!(pid = pid.as_raw(), "worker exited");
            }
            Ok(WaitStatus::Exited(pid, code)) => {
                warn!(pid = pid.as_raw(), code, "worker exited with non-zero status");
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                warn!(pid = pid.as_raw(), signal = %sig, "worker terminated by signal");
            }
            Ok(WaitStatus::StillAlive) => return,
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => return,
            Err(err) => {
                warn!("waitpid failed: {}", err);
                return;
            }
        }
    }
}
