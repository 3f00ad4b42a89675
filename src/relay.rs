//! Forwards keyboard signals received by the shell to its foreground pipelines.
//!
//! When the shell keeps the terminal (or has none), SIGINT and SIGTSTP land on the
//! shell itself. The relay catches them on a dedicated thread and delivers the same
//! signal to every foreground group in the registry. Background groups are left
//! alone.

use crate::registry::{Registry, SignalKind};
use log::{debug, warn};
use signal_hook::consts::{SIGCONT, SIGINT, SIGTSTP};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct SignalRelay {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalRelay {
    /// Starts catching SIGINT, SIGTSTP and SIGCONT.
    pub fn install(registry: Arc<Registry>) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTSTP, SIGCONT])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-relay".into())
            .spawn(move || {
                for signal in signals.forever() {
                    let Some(kind) = relayed_kind(signal) else {
                        continue;
                    };
                    forward(&registry, kind);
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stops catching signals and joins the relay thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("signal relay thread panicked");
            }
        }
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relayed_kind(signal: i32) -> Option<SignalKind> {
    match signal {
        SIGINT => Some(SignalKind::Interrupt),
        SIGTSTP => Some(SignalKind::Stop),
        SIGCONT => Some(SignalKind::Continue),
        _ => None,
    }
}

/// Delivers `kind` to every foreground group.
pub fn forward(registry: &Registry, kind: SignalKind) {
    for pgid in registry.foreground_groups() {
        debug!("relaying {:?} to process group {}", kind, pgid);
        if let Err(e) = registry.signal(pgid, kind) {
            // The group may have finished between the listing and the signal.
            debug!("{}", e);
        }
    }
}
