//! In-memory capture and display devices for unit tests.
//!
//! Each mock hands out a cloneable handle onto its shared log so tests can
//! both steer the device (complete a capture, complete a flip, inject a
//! failure) and inspect what the code under test asked of it. Readiness is
//! backed by a real pipe so the mocks also work under the scheduler.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::capture::{BufferRequest, CaptureDevice, Completion, FrameView, PixelFormat};
use crate::display::{
    CommitMode, DisplayBuffer, DisplayDevice, DisplayEvent, FbId, PlaneId, Transaction,
};
use crate::sink::FrameSink;
use crate::{Error, Result, StreamIndex};

const FRAME_LEN: usize = 16;

fn bell() -> (File, File) {
    let (rx, tx) = nix::unistd::pipe().unwrap();
    (File::from(rx), File::from(tx))
}

#[derive(Default)]
struct CaptureLog {
    queue: VecDeque<usize>,
    foreign: VecDeque<usize>,
    streaming: bool,
    stream_on_calls: usize,
    stream_off_calls: usize,
    reserved: Option<BufferRequest>,
    fail_reserve: bool,
    fail_stream_on: bool,
    fail_dequeue: bool,
    sequence: u32,
    rung: usize,
    ring: Option<File>,
}

#[derive(Clone)]
pub struct CaptureHandle(Rc<RefCell<CaptureLog>>);

impl CaptureHandle {
    /// Buffer indices owned by the device, in completion order.
    pub fn queue(&self) -> Vec<usize> {
        self.0.borrow().queue.iter().copied().collect()
    }

    pub fn streaming(&self) -> bool {
        self.0.borrow().streaming
    }

    pub fn stream_on_calls(&self) -> usize {
        self.0.borrow().stream_on_calls
    }

    pub fn stream_off_calls(&self) -> usize {
        self.0.borrow().stream_off_calls
    }

    pub fn reserved(&self) -> Option<BufferRequest> {
        self.0.borrow().reserved.clone()
    }

    pub fn fail_reserve(&self) {
        self.0.borrow_mut().fail_reserve = true;
    }

    pub fn fail_stream_on(&self) {
        self.0.borrow_mut().fail_stream_on = true;
    }

    pub fn fail_dequeue(&self) {
        self.0.borrow_mut().fail_dequeue = true;
    }

    /// Report `index` as completed next, whether or not it was queued.
    pub fn complete_foreign(&self, index: usize) {
        self.0.borrow_mut().foreign.push_back(index);
    }

    /// Make the readiness descriptor poll readable once.
    pub fn ring(&self) {
        let mut log = self.0.borrow_mut();
        log.rung += 1;
        if let Some(tx) = log.ring.as_mut() {
            tx.write_all(&[1]).unwrap();
        }
    }
}

pub struct MockCapture {
    name: String,
    log: Rc<RefCell<CaptureLog>>,
    bell: File,
    data: Vec<Vec<u8>>,
}

impl MockCapture {
    pub fn new(name: &str) -> (Self, CaptureHandle) {
        let (rx, tx) = bell();
        let log = Rc::new(RefCell::new(CaptureLog {
            ring: Some(tx),
            ..Default::default()
        }));
        let device = Self {
            name: name.to_string(),
            log: log.clone(),
            bell: rx,
            data: Vec::new(),
        };
        (device, CaptureHandle(log))
    }

    fn fail(&self, what: &str) -> Error {
        Error::device(self.name.clone(), io::Error::other(what.to_string()))
    }
}

impl CaptureDevice for MockCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn reserve(&mut self, request: &BufferRequest) -> Result<usize> {
        let mut log = self.log.borrow_mut();
        if log.fail_reserve {
            return Err(self.fail("cannot allocate buffers"));
        }
        log.reserved = Some(request.clone());
        let count = request.count();
        self.data = (0..count).map(|i| vec![i as u8; FRAME_LEN]).collect();
        Ok(count)
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if log.queue.contains(&index) {
            return Err(Error::assertion(format!("buffer {index} queued twice")));
        }
        log.queue.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Completion> {
        let mut log = self.log.borrow_mut();
        if log.rung > 0 {
            let mut byte = [0u8; 1];
            self.bell.read_exact(&mut byte).unwrap();
            log.rung -= 1;
        }
        if log.fail_dequeue {
            return Err(self.fail("end of stream"));
        }
        let next = match log.foreign.pop_front() {
            Some(index) => Some(index),
            None => log.queue.pop_front(),
        };
        let index = match next {
            Some(index) => index,
            None => return Err(self.fail("no buffer completed")),
        };
        log.sequence += 1;
        Ok(Completion {
            index,
            bytes_used: FRAME_LEN,
            sequence: log.sequence,
            timestamp: Duration::from_millis(u64::from(log.sequence) * 33),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.stream_on_calls += 1;
        if log.fail_stream_on {
            return Err(self.fail("stream on refused"));
        }
        log.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.stream_off_calls += 1;
        log.streaming = false;
        log.queue.clear();
        Ok(())
    }

    fn data(&self, index: usize) -> Option<&[u8]> {
        self.data.get(index).map(|d| d.as_slice())
    }

    fn readiness_fd(&self) -> RawFd {
        self.bell.as_raw_fd()
    }
}

#[derive(Default)]
struct DisplayLog {
    commits: Vec<(CommitMode, Transaction)>,
    events: usize,
    next_plane: u32,
    next_fb: u32,
    fail_commit: bool,
    ring: Option<File>,
}

#[derive(Clone)]
pub struct DisplayHandle(Rc<RefCell<DisplayLog>>);

impl DisplayHandle {
    pub fn commits(&self) -> Vec<(CommitMode, Transaction)> {
        self.0.borrow().commits.clone()
    }

    pub fn flips(&self) -> usize {
        self.0
            .borrow()
            .commits
            .iter()
            .filter(|(mode, _)| *mode == CommitMode::Flip)
            .count()
    }

    /// Deliver one page-flip completion event.
    pub fn complete_flip(&self) {
        let mut log = self.0.borrow_mut();
        log.events += 1;
        if let Some(tx) = log.ring.as_mut() {
            tx.write_all(&[1]).unwrap();
        }
    }

    pub fn fail_commits(&self) {
        self.0.borrow_mut().fail_commit = true;
    }
}

pub struct MockDisplay {
    log: Rc<RefCell<DisplayLog>>,
    bell: File,
}

impl MockDisplay {
    pub const MODE: (u32, u32) = (1920, 1080);

    pub fn new() -> (Self, DisplayHandle) {
        let (rx, tx) = bell();
        let log = Rc::new(RefCell::new(DisplayLog {
            ring: Some(tx),
            next_fb: 100,
            ..Default::default()
        }));
        (
            Self {
                log: log.clone(),
                bell: rx,
            },
            DisplayHandle(log),
        )
    }
}

impl DisplayDevice for MockDisplay {
    fn name(&self) -> &str {
        "mock-card"
    }

    fn mode_size(&self) -> (u32, u32) {
        Self::MODE
    }

    fn reserve_plane(&mut self, _format: PixelFormat) -> Result<PlaneId> {
        let mut log = self.log.borrow_mut();
        log.next_plane += 1;
        Ok(PlaneId(log.next_plane))
    }

    fn allocate_buffers(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<DisplayBuffer>> {
        let mut log = self.log.borrow_mut();
        let len = (width * height * format.bits_per_pixel() / 8) as usize;
        Ok((0..count)
            .map(|_| {
                log.next_fb += 1;
                DisplayBuffer {
                    fb: FbId(log.next_fb),
                    dmabuf: None,
                    len,
                }
            })
            .collect())
    }

    fn commit(&mut self, transaction: &Transaction, mode: CommitMode) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if log.fail_commit {
            return Err(Error::device(
                "mock-card",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        log.commits.push((mode, transaction.clone()));
        Ok(())
    }

    fn read_completion_events(&mut self) -> Result<Vec<DisplayEvent>> {
        let mut log = self.log.borrow_mut();
        let n = std::mem::take(&mut log.events);
        let mut bytes = vec![0u8; n];
        self.bell.read_exact(&mut bytes).unwrap();
        Ok(vec![DisplayEvent::FlipComplete; n])
    }

    fn readiness_fd(&self) -> RawFd {
        self.bell.as_raw_fd()
    }
}

/// Records `(stream, buffer index, bytes)` for every consumed frame.
#[derive(Clone, Default)]
pub struct RecordingSink(Rc<RefCell<Vec<(StreamIndex, usize, usize)>>>);

impl RecordingSink {
    pub fn frames(&self) -> Vec<(StreamIndex, usize, usize)> {
        self.0.borrow().clone()
    }
}

impl FrameSink for RecordingSink {
    fn consume(&mut self, frame: FrameView<'_>) -> Result<()> {
        self.0
            .borrow_mut()
            .push((frame.stream.index, frame.buffer.index(), frame.data.len()));
        Ok(())
    }
}
