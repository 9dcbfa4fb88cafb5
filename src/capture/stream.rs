use std::io;
use std::os::fd::RawFd;

use tracing::{info, instrument};

use crate::capture::{BufferRequest, CaptureDevice, FrameBuffer, StreamInfo};
use crate::{Error, Result, StreamIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Configured,
    Reserved,
    Streaming,
    Stopped,
}

/// Buffer-pool lifecycle around one capture device.
///
/// Tracks which pool slots the device currently owns. A slot is either
/// queued (held here on behalf of the device), idle (reserved but not
/// submitted, or returned after stream-off) or out with the caller.
pub struct CaptureStream {
    info: StreamInfo,
    device: Box<dyn CaptureDevice>,
    queued: Vec<Option<FrameBuffer>>,
    idle: Vec<FrameBuffer>,
    state: StreamState,
    frames: u64,
}

impl CaptureStream {
    pub fn new(info: StreamInfo, device: Box<dyn CaptureDevice>) -> Self {
        Self {
            info,
            device,
            queued: Vec::new(),
            idle: Vec::new(),
            state: StreamState::Configured,
            frames: 0,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn index(&self) -> StreamIndex {
        self.info.index
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Frames taken since start.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Reserve the pool once. Fails with a device error if the driver
    /// cannot provide exactly `buffer_count` buffers.
    #[instrument(skip(self, request), fields(device = %self.info.device))]
    pub fn reserve(&mut self, request: BufferRequest) -> Result<()> {
        if self.state != StreamState::Configured {
            return Err(Error::assertion(format!(
                "{}: pool reserved twice",
                self.info.device
            )));
        }

        let wanted = request.count();
        if wanted != self.info.buffer_count {
            return Err(Error::config(format!(
                "{}: pool of {} buffers requested, stream has {}",
                self.info.device, wanted, self.info.buffer_count
            )));
        }

        let granted = self.device.reserve(&request)?;
        if granted != wanted {
            return Err(Error::device(
                self.info.device.clone(),
                io::Error::other(format!(
                    "requested {} buffers, device granted {}",
                    wanted, granted
                )),
            ));
        }

        self.idle = (0..wanted)
            .map(|index| FrameBuffer::new(self.info.index, index))
            .collect();
        self.queued = (0..wanted).map(|_| None).collect();
        self.state = StreamState::Reserved;
        Ok(())
    }

    /// Take the lowest-indexed buffer out of the pool before streaming
    /// starts, e.g. to put it on screen.
    pub fn detach_idle(&mut self) -> Option<FrameBuffer> {
        if self.state != StreamState::Reserved || self.idle.is_empty() {
            return None;
        }
        Some(self.idle.remove(0))
    }

    /// Submit every idle buffer and turn the device on.
    pub fn start(&mut self) -> Result<()> {
        if self.state != StreamState::Reserved {
            return Err(Error::assertion(format!(
                "{}: start in state {:?}",
                self.info.device, self.state
            )));
        }

        for buf in std::mem::take(&mut self.idle) {
            self.submit(buf)?;
        }

        self.device.stream_on()?;
        self.state = StreamState::Streaming;
        info!(
            device = %self.info.device,
            queued = self.queued_count(),
            "stream on"
        );
        Ok(())
    }

    /// Remove one completed buffer from the device queue.
    pub fn take(&mut self) -> Result<FrameBuffer> {
        if self.state != StreamState::Streaming {
            return Err(Error::assertion(format!(
                "{}: take while {:?}",
                self.info.device, self.state
            )));
        }

        let completion = self.device.dequeue()?;

        let slot = self.queued.get_mut(completion.index).ok_or_else(|| {
            Error::assertion(format!(
                "{}: device completed unknown buffer {}",
                self.info.device, completion.index
            ))
        })?;
        let mut buf = slot.take().ok_or_else(|| {
            Error::assertion(format!(
                "{}: buffer {} completed but was not queued",
                self.info.device, completion.index
            ))
        })?;

        buf.fill(
            completion.bytes_used,
            completion.sequence,
            completion.timestamp,
        );
        self.frames += 1;
        Ok(buf)
    }

    /// Hand a buffer back for reuse. After stop it is parked as idle.
    pub fn give(&mut self, buf: FrameBuffer) -> Result<()> {
        if buf.stream() != self.info.index {
            return Err(Error::assertion(format!(
                "{}: given buffer of stream {}",
                self.info.device,
                buf.stream()
            )));
        }

        match self.state {
            StreamState::Streaming => self.submit(buf),
            _ => {
                self.idle.push(buf);
                Ok(())
            }
        }
    }

    /// Stop submission and turn the device off. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != StreamState::Streaming {
            return Ok(());
        }
        self.state = StreamState::Stopped;

        // Stream-off hands every queued buffer back to userspace.
        let drained: Vec<FrameBuffer> = self.queued.iter_mut().filter_map(Option::take).collect();
        self.idle.extend(drained);

        self.device.stream_off()?;
        info!(device = %self.info.device, frames = self.frames, "stream off");
        Ok(())
    }

    /// Bytes captured into `buf`, empty when the pool is not CPU-mapped.
    pub fn data(&self, buf: &FrameBuffer) -> &[u8] {
        match self.device.data(buf.index()) {
            Some(data) => &data[..buf.bytes_used().min(data.len())],
            None => &[],
        }
    }

    /// Buffers currently owned by the device.
    pub fn queued_count(&self) -> usize {
        self.queued.iter().filter(|slot| slot.is_some()).count()
    }

    /// Buffers reserved but not submitted.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn readiness_fd(&self) -> RawFd {
        self.device.readiness_fd()
    }

    fn submit(&mut self, buf: FrameBuffer) -> Result<()> {
        let index = buf.index();
        match self.queued.get(index) {
            Some(None) => {}
            Some(Some(_)) => {
                return Err(Error::assertion(format!(
                    "{}: buffer {} already queued",
                    self.info.device, index
                )))
            }
            None => {
                return Err(Error::assertion(format!(
                    "{}: buffer {} outside pool",
                    self.info.device, index
                )))
            }
        }

        if let Err(err) = self.device.queue(index) {
            self.idle.push(buf);
            return Err(err);
        }
        self.queued[index] = Some(buf);
        Ok(())
    }
}
