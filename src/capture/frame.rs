use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::StreamInfo;
use crate::StreamIndex;

/// One slot of a stream's buffer pool.
///
/// Deliberately neither `Clone` nor `Copy`: holding the value is holding
/// ownership of the underlying memory. It moves between the capture queue,
/// the pump, the display pending queue, the screen and retirement, and is
/// never in two of those places at once.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    stream: StreamIndex,
    index: usize,
    bytes_used: usize,
    sequence: u32,
    timestamp: Duration,
}

impl FrameBuffer {
    pub(crate) fn new(stream: StreamIndex, index: usize) -> Self {
        Self {
            stream,
            index,
            bytes_used: 0,
            sequence: 0,
            timestamp: Duration::ZERO,
        }
    }

    pub fn stream(&self) -> StreamIndex {
        self.stream
    }

    /// Slot index within the owning stream's pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Driver frame sequence number of the last capture into this buffer.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Driver timestamp of the last capture into this buffer.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub(crate) fn fill(&mut self, bytes_used: usize, sequence: u32, timestamp: Duration) {
        self.bytes_used = bytes_used;
        self.sequence = sequence;
        self.timestamp = timestamp;
    }
}

/// Borrowed view of a captured frame handed to a sink.
///
/// The lifetime ties `data` to the dispatch call: the memory goes back to
/// the capture queue as soon as the sink returns.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub stream: &'a StreamInfo,
    pub buffer: &'a FrameBuffer,
    pub data: &'a [u8],
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("stream", &self.stream.index)
            .field("buffer", &self.buffer.index)
            .field("sequence", &self.buffer.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Pixel and metadata formats we know how to stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Rgb565,
    Rgb24,
    Bgr24,
    Xbgr32,
    Nv12,
    Grey,
    Mjpeg,
    Srggb8,
    Sgrbg8,
    Sgbrg8,
    Sbggr8,
    /// V4L2_META_FMT_GENERIC_8
    Generic8,
    /// V4L2_META_FMT_GENERIC_CSI2_12
    GenericCsi2_12,
}

impl PixelFormat {
    /// V4L2 fourcc code.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Rgb565 => *b"RGBP",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Xbgr32 => *b"XR24",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Grey => *b"GREY",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Srggb8 => *b"RGGB",
            PixelFormat::Sgrbg8 => *b"GRBG",
            PixelFormat::Sgbrg8 => *b"GBRG",
            PixelFormat::Sbggr8 => *b"BA81",
            PixelFormat::Generic8 => *b"MET8",
            PixelFormat::GenericCsi2_12 => *b"MC1C",
        }
    }

    /// Bits per pixel of a packed line, 0 for compressed formats.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Rgb565 => 16,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 24,
            PixelFormat::Xbgr32 => 32,
            PixelFormat::Nv12 | PixelFormat::GenericCsi2_12 => 12,
            PixelFormat::Grey
            | PixelFormat::Srggb8
            | PixelFormat::Sgrbg8
            | PixelFormat::Sgbrg8
            | PixelFormat::Sbggr8
            | PixelFormat::Generic8 => 8,
            PixelFormat::Mjpeg => 0,
        }
    }

    /// Format a buffer of this kind is scanned out as, if any. Metadata is
    /// shown as RGB565 noise so that embedded lines remain visible.
    pub fn display_format(self) -> Option<PixelFormat> {
        match self {
            PixelFormat::Generic8 | PixelFormat::GenericCsi2_12 => Some(PixelFormat::Rgb565),
            PixelFormat::Yuyv
            | PixelFormat::Uyvy
            | PixelFormat::Rgb565
            | PixelFormat::Rgb24
            | PixelFormat::Bgr24
            | PixelFormat::Xbgr32
            | PixelFormat::Grey => Some(self),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.fourcc()))
    }
}
