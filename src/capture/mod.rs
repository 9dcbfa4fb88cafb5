pub mod frame;
pub mod stream;
pub mod v4l2;

use std::os::fd::RawFd;
use std::time::Duration;

pub use frame::{FrameBuffer, FrameView, PixelFormat};
pub use stream::CaptureStream;
pub use v4l2::V4l2Capture;

use crate::{Result, StreamIndex};

/// Resolved identity of one capture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub index: StreamIndex,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    pub display: bool,
    pub embedded: bool,
}

/// How a pool is backed when reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferRequest {
    /// Device-allocated memory, `n` buffers.
    Mmap(usize),
    /// Externally allocated DMA-BUFs, one per buffer, imported zero-copy.
    DmaBuf(Vec<ImportedBuffer>),
}

impl BufferRequest {
    pub fn count(&self) -> usize {
        match self {
            BufferRequest::Mmap(n) => *n,
            BufferRequest::DmaBuf(bufs) => bufs.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedBuffer {
    pub fd: RawFd,
    pub len: usize,
}

/// A capture the device finished writing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub index: usize,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Capture capability consumed by [`CaptureStream`].
///
/// Buffers are addressed by pool index; ownership bookkeeping lives in the
/// stream wrapper, the device only mirrors the kernel queue.
pub trait CaptureDevice {
    fn name(&self) -> &str;

    /// Allocate or import the pool. Returns the number of buffers granted.
    fn reserve(&mut self, request: &BufferRequest) -> Result<usize>;

    fn queue(&mut self, index: usize) -> Result<()>;

    /// Remove one completed buffer. Only called after readiness was signalled.
    fn dequeue(&mut self) -> Result<Completion>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    /// CPU-visible memory of a buffer, when the pool is mapped.
    fn data(&self, index: usize) -> Option<&[u8]>;

    /// Descriptor that polls readable when a capture completed.
    fn readiness_fd(&self) -> RawFd;
}
