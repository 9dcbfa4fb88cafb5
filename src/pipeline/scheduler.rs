//! Single-threaded readiness loop

use std::cell::Cell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, trace};

use crate::{Error, Result, StreamIndex};

/// What a registered descriptor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Control,
    Display,
    Capture(StreamIndex),
}

/// Shared stop flag, observed between dispatch batches.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Rc<Cell<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.get()
    }
}

/// Receiver of readiness callbacks.
pub trait Dispatch {
    fn dispatch(&mut self, source: Source, stop: &StopHandle) -> Result<()>;

    /// Orderly teardown, called once when the loop exits for any reason.
    fn shutdown(&mut self) -> Result<()>;
}

/// Multiplexes a fixed set of descriptors and hands every ready one to a
/// [`Dispatch`] target. A callback always runs to completion before the
/// next wait; an error from any callback ends the loop.
#[derive(Default)]
pub struct EventScheduler {
    sources: Vec<(RawFd, Source)>,
    stop: StopHandle,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: RawFd, source: Source) -> Result<()> {
        if fd < 0 {
            return Err(Error::config(format!("{:?}: invalid descriptor {}", source, fd)));
        }
        if self.sources.iter().any(|&(_, s)| s == source) {
            return Err(Error::assertion(format!("{:?} registered twice", source)));
        }
        debug!(fd, ?source, "source registered");
        self.sources.push((fd, source));
        Ok(())
    }

    pub fn sources(&self) -> impl Iterator<Item = Source> + '_ {
        self.sources.iter().map(|&(_, s)| s)
    }

    /// Ask [`run`](Self::run) to return after the current batch.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Block on the registered sources until stopped or a callback fails.
    pub fn run(&mut self, target: &mut dyn Dispatch) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::config("nothing to wait on"));
        }

        info!(sources = self.sources.len(), "event loop running");
        let outcome = self.dispatch_until_stopped(target);

        match &outcome {
            Ok(()) => info!("event loop stopped"),
            Err(e) => error!("event loop aborted: {}", e),
        }

        if let Err(e) = target.shutdown() {
            error!("shutdown failed: {}", e);
            if outcome.is_ok() {
                return Err(e);
            }
        }
        outcome
    }

    fn dispatch_until_stopped(&mut self, target: &mut dyn Dispatch) -> Result<()> {
        while !self.stop.is_stopped() {
            for source in self.wait()? {
                trace!(?source, "ready");
                target.dispatch(source, &self.stop)?;
            }
        }
        Ok(())
    }

    fn wait(&self) -> Result<Vec<Source>> {
        // SAFETY: registered descriptors are owned by the dispatch target,
        // which outlives the loop.
        let mut fds: Vec<PollFd> = self
            .sources
            .iter()
            .map(|&(fd, _)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::device("poll", e)),
            }
        }

        let ready = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        Ok(fds
            .iter()
            .zip(&self.sources)
            .filter(|(fd, _)| fd.revents().is_some_and(|r| r.intersects(ready)))
            .map(|(_, &(_, source))| source)
            .collect())
    }
}
