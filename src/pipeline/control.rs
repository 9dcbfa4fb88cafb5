use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::{debug, info};

use crate::{ControlKind, Error, Result};

/// Wakes a [`ControlInput::Signal`] from any thread.
#[derive(Debug, Clone)]
pub struct ControlTrigger(Arc<File>);

impl ControlTrigger {
    pub fn fire(&self) -> io::Result<()> {
        (&*self.0).write_all(&[1])
    }
}

/// Control readiness source of the event loop. Any input means stop.
#[derive(Debug)]
pub enum ControlInput {
    /// Enter on the terminal.
    Stdin,
    /// Self-pipe written by a [`ControlTrigger`].
    Signal { rx: File, trigger: ControlTrigger },
}

impl ControlInput {
    pub fn new(kind: ControlKind) -> Result<Self> {
        match kind {
            ControlKind::Stdin => Ok(ControlInput::Stdin),
            ControlKind::Signal => Self::signal(),
        }
    }

    pub fn signal() -> Result<Self> {
        let (rx, tx) = nix::unistd::pipe().map_err(|e| Error::device("control pipe", e))?;
        Ok(ControlInput::Signal {
            rx: File::from(rx),
            trigger: ControlTrigger(Arc::new(File::from(tx))),
        })
    }

    pub fn trigger(&self) -> Option<ControlTrigger> {
        match self {
            ControlInput::Stdin => None,
            ControlInput::Signal { trigger, .. } => Some(trigger.clone()),
        }
    }

    /// Consume whatever made the source readable.
    pub fn drain(&mut self) -> Result<()> {
        match self {
            ControlInput::Stdin => {
                let mut line = String::new();
                io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .map_err(|e| Error::device("stdin", e))?;
                info!("stop requested from terminal");
            }
            ControlInput::Signal { rx, .. } => {
                let mut bytes = [0u8; 64];
                let n = rx.read(&mut bytes).map_err(|e| Error::device("control pipe", e))?;
                debug!(wakeups = n, "control pipe drained");
                info!("stop requested");
            }
        }
        Ok(())
    }

    pub fn readiness_fd(&self) -> RawFd {
        match self {
            ControlInput::Stdin => io::stdin().as_raw_fd(),
            ControlInput::Signal { rx, .. } => rx.as_raw_fd(),
        }
    }
}
