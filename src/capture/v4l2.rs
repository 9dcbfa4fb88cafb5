//! V4L2 capture with explicit buffer queue control and DMA-BUF import

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use memmap2::{Mmap, MmapOptions};
use nix::{ioctl_readwrite, ioctl_write_ptr};
use tracing::{debug, info, instrument, warn};
use v4l::capability::Flags as CapFlags;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{BufferRequest, CaptureDevice, Completion, ImportedBuffer, StreamInfo};
use crate::{Error, Result};

// ===== V4L2 constants =====

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_BUF_TYPE_META_CAPTURE: u32 = 13;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_MEMORY_DMABUF: u32 = 4;
const V4L2_BUF_FLAG_ERROR: u32 = 0x0040;

// ===== V4L2 ioctl structures =====

/// struct v4l2_requestbuffers (20 bytes)
#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    buf_type: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

/// struct v4l2_timecode (16 bytes)
#[repr(C)]
#[derive(Default)]
struct V4l2Timecode {
    tc_type: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    planes: *mut libc::c_void,
    fd: i32,
}

/// struct v4l2_buffer, single-planar
#[repr(C)]
struct V4l2Buffer {
    index: u32,
    buf_type: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

impl V4l2Buffer {
    fn new(buf_type: u32, memory: u32, index: u32) -> Self {
        Self {
            index,
            buf_type,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            timecode: V4l2Timecode::default(),
            sequence: 0,
            memory,
            m: V4l2BufferM { offset: 0 },
            length: 0,
            reserved2: 0,
            request_fd: 0,
        }
    }
}

ioctl_readwrite!(vidioc_reqbufs, b'V', 8, V4l2RequestBuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, V4l2Buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, V4l2Buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, V4l2Buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);

/// Pool backing of a reserved device
enum Pool {
    Empty,
    Mapped(Vec<Mmap>),
    /// Display buffers written in place. `maps` is empty when the
    /// exporter refused a CPU mapping.
    Imported {
        bufs: Vec<ImportedBuffer>,
        maps: Vec<Mmap>,
    },
}

/// Read-only views of imported DMA-BUFs, for sinks that look at the bytes.
fn map_imported(bufs: &[ImportedBuffer]) -> io::Result<Vec<Mmap>> {
    bufs.iter()
        .map(|buf| {
            // SAFETY: the fd stays open for the life of the display buffer,
            // which outlives the capture device.
            unsafe { MmapOptions::new().len(buf.len).map(buf.fd) }
        })
        .collect()
}

/// V4L2 capture device
pub struct V4l2Capture {
    // Mappings go before the device is closed.
    pool: Pool,
    device: Device,
    path: String,
    buf_type: u32,
    memory: u32,
    streaming: bool,
}

impl V4l2Capture {
    /// Open the node and apply the stream's already-negotiated format.
    #[instrument(skip(info), fields(device = %info.device))]
    pub fn open(info: &StreamInfo) -> Result<Self> {
        let path = info.device.clone();
        let device = Device::with_path(&path).map_err(|e| Error::device(&path, e))?;

        let caps = device.query_caps().map_err(|e| Error::device(&path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        let buf_type = if info.embedded {
            // Metadata formats are set by the topology setup, not here.
            debug!("metadata capture, leaving format as configured");
            V4L2_BUF_TYPE_META_CAPTURE
        } else {
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                return Err(Error::config(format!(
                    "{}: device doesn't support video capture",
                    path
                )));
            }

            let mut fmt = device.format().map_err(|e| Error::device(&path, e))?;
            fmt.width = info.width;
            fmt.height = info.height;
            fmt.fourcc = FourCC::new(&info.format.fourcc());

            let applied = device.set_format(&fmt).map_err(|e| Error::device(&path, e))?;
            if applied.width != info.width
                || applied.height != info.height
                || applied.fourcc != fmt.fourcc
            {
                return Err(Error::config(format!(
                    "{}: driver chose {}x{} {} instead of {}x{} {}",
                    path,
                    applied.width,
                    applied.height,
                    applied.fourcc,
                    info.width,
                    info.height,
                    info.format
                )));
            }
            V4L2_BUF_TYPE_VIDEO_CAPTURE
        };

        Ok(Self {
            pool: Pool::Empty,
            device,
            path,
            buf_type,
            memory: V4L2_MEMORY_MMAP,
            streaming: false,
        })
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn err(&self, source: impl Into<io::Error>) -> Error {
        Error::device(self.path.clone(), source)
    }
}

impl CaptureDevice for V4l2Capture {
    fn name(&self) -> &str {
        &self.path
    }

    fn reserve(&mut self, request: &BufferRequest) -> Result<usize> {
        let memory = match request {
            BufferRequest::Mmap(_) => V4L2_MEMORY_MMAP,
            BufferRequest::DmaBuf(_) => V4L2_MEMORY_DMABUF,
        };

        let mut req = V4l2RequestBuffers {
            count: request.count() as u32,
            buf_type: self.buf_type,
            memory,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        unsafe { vidioc_reqbufs(self.fd(), &mut req) }.map_err(|e| self.err(e))?;
        self.memory = memory;

        let granted = req.count as usize;

        self.pool = match request {
            BufferRequest::Mmap(_) => {
                let mut maps = Vec::with_capacity(granted);
                for index in 0..granted {
                    let mut buf = V4l2Buffer::new(self.buf_type, memory, index as u32);
                    unsafe { vidioc_querybuf(self.fd(), &mut buf) }.map_err(|e| self.err(e))?;

                    // SAFETY: MMAP buffers report their mapping offset in m.offset.
                    let offset = unsafe { buf.m.offset };
                    let map = unsafe {
                        MmapOptions::new()
                            .offset(u64::from(offset))
                            .len(buf.length as usize)
                            .map(self.fd())
                    }
                    .map_err(|e| self.err(e))?;
                    maps.push(map);
                }
                Pool::Mapped(maps)
            }
            BufferRequest::DmaBuf(bufs) => {
                let maps = match map_imported(bufs) {
                    Ok(maps) => maps,
                    Err(e) => {
                        warn!(device = %self.path, "imported buffers not CPU-readable: {}", e);
                        Vec::new()
                    }
                };
                Pool::Imported {
                    bufs: bufs.clone(),
                    maps,
                }
            }
        };

        info!(
            device = %self.path,
            buffers = granted,
            dmabuf = memory == V4L2_MEMORY_DMABUF,
            "buffers reserved"
        );
        Ok(granted)
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        let mut buf = V4l2Buffer::new(self.buf_type, self.memory, index as u32);

        if let Pool::Imported { bufs, .. } = &self.pool {
            let imported = bufs.get(index).ok_or_else(|| {
                Error::assertion(format!("{}: no imported buffer {}", self.path, index))
            })?;
            buf.m = V4l2BufferM { fd: imported.fd };
            buf.length = imported.len as u32;
        }

        unsafe { vidioc_qbuf(self.fd(), &mut buf) }.map_err(|e| self.err(e))?;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Completion> {
        let mut buf = V4l2Buffer::new(self.buf_type, self.memory, 0);
        unsafe { vidioc_dqbuf(self.fd(), &mut buf) }.map_err(|e| self.err(e))?;

        if buf.flags & V4L2_BUF_FLAG_ERROR != 0 {
            warn!(
                device = %self.path,
                index = buf.index,
                sequence = buf.sequence,
                "driver flagged buffer as corrupt"
            );
        }

        Ok(Completion {
            index: buf.index as usize,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp: Duration::from_secs(buf.timestamp.tv_sec as u64)
                + Duration::from_micros(buf.timestamp.tv_usec as u64),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let buf_type = self.buf_type as libc::c_int;
        unsafe { vidioc_streamon(self.fd(), &buf_type) }.map_err(|e| self.err(e))?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        let buf_type = self.buf_type as libc::c_int;
        unsafe { vidioc_streamoff(self.fd(), &buf_type) }.map_err(|e| self.err(e))?;
        Ok(())
    }

    fn data(&self, index: usize) -> Option<&[u8]> {
        match &self.pool {
            Pool::Mapped(maps) | Pool::Imported { maps, .. } => maps.get(index).map(|m| &m[..]),
            Pool::Empty => None,
        }
    }

    fn readiness_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!(device = %self.path, "stream off on drop failed: {}", e);
        }
    }
}
