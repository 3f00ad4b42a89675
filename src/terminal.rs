//! Controlling-terminal hand-off for foreground pipelines.

use log::{debug, warn};
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{Pid, getpgrp, tcsetpgrp};
use std::io::{self, IsTerminal};
use std::os::fd::AsFd;

/// The shell's claim on the terminal attached to stdin.
#[derive(Debug)]
pub struct Terminal {
    shell_pgid: Pid,
}

impl Terminal {
    /// Returns `None` when stdin is not a terminal.
    pub fn acquire() -> Option<Self> {
        if !io::stdin().is_terminal() {
            return None;
        }
        Some(Self {
            shell_pgid: getpgrp(),
        })
    }

    /// Makes `pgid` the terminal's foreground process group.
    pub fn give_to(&self, pgid: Pid) {
        debug!("giving the terminal to process group {}", pgid);
        if let Err(e) = set_foreground(pgid) {
            warn!("cannot give the terminal to {}: {}", pgid, e);
        }
    }

    /// Takes the terminal back for the shell.
    pub fn reclaim(&self) {
        if let Err(e) = set_foreground(self.shell_pgid) {
            warn!("cannot reclaim the terminal: {}", e);
        }
    }
}

/// `tcsetpgrp` from a background group raises SIGTTOU unless it is blocked.
fn set_foreground(pgid: Pid) -> nix::Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTTOU);
    mask.thread_block()?;
    let stdin = io::stdin();
    let result = tcsetpgrp(stdin.as_fd(), pgid);
    mask.thread_unblock()?;
    result
}
