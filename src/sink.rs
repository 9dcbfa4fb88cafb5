//! Frame consumers: saving to disk and transmitting to a server
//!
//! A sink sees each frame through a [`FrameView`] that borrows the capture
//! buffer for the duration of [`FrameSink::consume`] only. Anything a sink
//! wants to keep must be copied out before returning.

use std::fmt;
use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::FrameView;
use crate::{Error, OutputConfig, Result, StreamIndex};

/// Wire header prefix of [`NetSink`] frames.
pub const NET_MAGIC: &[u8; 4] = b"FPMP";
pub const NET_HEADER_LEN: usize = 24;

pub trait FrameSink {
    fn consume(&mut self, frame: FrameView<'_>) -> Result<()>;
}

/// Drops every frame.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl FrameSink for DiscardSink {
    fn consume(&mut self, _frame: FrameView<'_>) -> Result<()> {
        Ok(())
    }
}

/// Writes each frame to `<dir>/frame-<stream>-<sequence>.raw`.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| Error::device(dir.display().to_string(), e))?;
        info!(dir = %dir.display(), "saving frames");
        Ok(Self { dir })
    }

    pub fn path_for(&self, stream: StreamIndex, sequence: u32) -> PathBuf {
        self.dir.join(format!("frame-{}-{}.raw", stream, sequence))
    }
}

impl FrameSink for FileSink {
    fn consume(&mut self, frame: FrameView<'_>) -> Result<()> {
        let path = self.path_for(frame.stream.index, frame.buffer.sequence());
        fs::write(&path, frame.data).map_err(|e| Error::device(path.display().to_string(), e))?;
        debug!(
            path = %path.display(),
            bytes = frame.data.len(),
            timestamp = ?frame.buffer.timestamp(),
            "frame saved"
        );
        Ok(())
    }
}

/// Which streams a [`NetSink`] transmits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "FilterRepr", into = "FilterRepr")]
pub enum StreamFilter {
    #[default]
    All,
    Only(Vec<StreamIndex>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FilterRepr {
    Keyword(String),
    List(Vec<StreamIndex>),
}

impl TryFrom<FilterRepr> for StreamFilter {
    type Error = String;

    fn try_from(repr: FilterRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            FilterRepr::Keyword(word) => word.parse(),
            FilterRepr::List(list) => Ok(StreamFilter::Only(list)),
        }
    }
}

impl From<StreamFilter> for FilterRepr {
    fn from(filter: StreamFilter) -> Self {
        match filter {
            StreamFilter::All => FilterRepr::Keyword("all".into()),
            StreamFilter::Only(list) => FilterRepr::List(list),
        }
    }
}

impl FromStr for StreamFilter {
    type Err = String;

    /// `all`, or a comma-separated list of stream indices.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim() == "all" {
            return Ok(StreamFilter::All);
        }
        s.split(',')
            .map(|part| {
                part.trim()
                    .parse::<StreamIndex>()
                    .map_err(|_| format!("bad stream index '{}'", part.trim()))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(StreamFilter::Only)
    }
}

impl StreamFilter {
    pub fn accepts(&self, stream: StreamIndex) -> bool {
        match self {
            StreamFilter::All => true,
            StreamFilter::Only(list) => list.contains(&stream),
        }
    }
}

impl fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFilter::All => f.write_str("all"),
            StreamFilter::Only(list) => {
                let parts: Vec<String> = list.iter().map(|i| i.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Streams frames over TCP, each prefixed by a 24-byte big-endian header:
/// magic, stream, width, height, fourcc, payload length.
pub struct NetSink {
    address: String,
    socket: TcpStream,
    filter: StreamFilter,
    header: BytesMut,
}

impl NetSink {
    pub fn connect(address: &str, filter: StreamFilter) -> Result<Self> {
        let socket = TcpStream::connect(address).map_err(|e| Error::device(address, e))?;
        socket
            .set_nodelay(true)
            .map_err(|e| Error::device(address, e))?;
        info!(address, streams = %filter, "transmitting frames");
        Ok(Self {
            address: address.to_string(),
            socket,
            filter,
            header: BytesMut::with_capacity(NET_HEADER_LEN),
        })
    }
}

impl FrameSink for NetSink {
    fn consume(&mut self, frame: FrameView<'_>) -> Result<()> {
        if !self.filter.accepts(frame.stream.index) {
            return Ok(());
        }

        self.header.clear();
        self.header.put_slice(NET_MAGIC);
        self.header.put_u32(frame.stream.index as u32);
        self.header.put_u32(frame.stream.width);
        self.header.put_u32(frame.stream.height);
        self.header.put_slice(&frame.stream.format.fourcc());
        self.header.put_u32(frame.data.len() as u32);

        self.socket
            .write_all(&self.header)
            .and_then(|_| self.socket.write_all(frame.data))
            .map_err(|e| Error::device(self.address.clone(), e))
    }
}

/// Configured outputs. Saving sees every frame, displayed or not;
/// transmission only sees frames that are not displayed.
pub struct Outputs {
    pub save: Option<Box<dyn FrameSink>>,
    pub transmit: Box<dyn FrameSink>,
}

impl Outputs {
    pub fn from_config(output: &OutputConfig) -> Result<Self> {
        let save = match &output.save_dir {
            Some(dir) => Some(Box::new(FileSink::new(dir)?) as Box<dyn FrameSink>),
            None => None,
        };
        let transmit: Box<dyn FrameSink> = match &output.tx {
            Some(tx) => Box::new(NetSink::connect(&tx.address, tx.streams.clone())?),
            None => Box::new(DiscardSink),
        };
        Ok(Self { save, transmit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameBuffer, PixelFormat, StreamInfo};
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    fn info(index: StreamIndex) -> StreamInfo {
        StreamInfo {
            index,
            device: format!("/dev/video{index}"),
            width: 4,
            height: 2,
            format: PixelFormat::Grey,
            buffer_count: 3,
            display: false,
            embedded: false,
        }
    }

    fn buffer(stream: StreamIndex, sequence: u32) -> FrameBuffer {
        let mut buf = FrameBuffer::new(stream, 1);
        buf.fill(8, sequence, Duration::from_millis(5));
        buf
    }

    #[test]
    fn test_file_sink_names_by_stream_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("out")).unwrap();
        let info = info(3);
        let buf = buffer(3, 42);
        let data = [7u8; 8];

        sink.consume(FrameView {
            stream: &info,
            buffer: &buf,
            data: &data,
        })
        .unwrap();

        let written = fs::read(dir.path().join("out/frame-3-42.raw")).unwrap();
        assert_eq!(written, data);
    }

    #[test]
    fn test_net_sink_frames_and_filters() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut sink = NetSink::connect(&address, StreamFilter::Only(vec![1])).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let skipped = info(0);
        let sent = info(1);
        let buf0 = buffer(0, 1);
        let buf1 = buffer(1, 1);
        let data = [0xAB; 8];

        sink.consume(FrameView {
            stream: &skipped,
            buffer: &buf0,
            data: &data,
        })
        .unwrap();
        sink.consume(FrameView {
            stream: &sent,
            buffer: &buf1,
            data: &data,
        })
        .unwrap();
        drop(sink);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();

        assert_eq!(received.len(), NET_HEADER_LEN + 8);
        assert_eq!(&received[0..4], b"FPMP");
        assert_eq!(&received[4..8], &1u32.to_be_bytes());
        assert_eq!(&received[8..12], &4u32.to_be_bytes());
        assert_eq!(&received[12..16], &2u32.to_be_bytes());
        assert_eq!(&received[16..20], b"GREY");
        assert_eq!(&received[20..24], &8u32.to_be_bytes());
        assert_eq!(&received[24..], &data);
    }

    #[test]
    fn test_stream_filter_parsing() {
        assert_eq!("all".parse::<StreamFilter>().unwrap(), StreamFilter::All);
        assert_eq!(
            "0, 2".parse::<StreamFilter>().unwrap(),
            StreamFilter::Only(vec![0, 2])
        );
        assert!("x".parse::<StreamFilter>().is_err());
        assert!(!StreamFilter::Only(vec![2]).accepts(1));
        assert_eq!(StreamFilter::Only(vec![0, 2]).to_string(), "0,2");
    }

    #[test]
    fn test_no_outputs_means_discard() {
        let outputs = Outputs::from_config(&OutputConfig::default()).unwrap();
        assert!(outputs.save.is_none());
    }

    #[test]
    fn test_save_dir_creates_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            save_dir: Some(dir.path().join("frames")),
            tx: None,
        };
        let mut outputs = Outputs::from_config(&output).unwrap();
        assert!(dir.path().join("frames").is_dir());

        let info = info(1);
        let buf = buffer(1, 7);
        outputs
            .save
            .as_mut()
            .unwrap()
            .consume(FrameView {
                stream: &info,
                buffer: &buf,
                data: &[1, 2, 3],
            })
            .unwrap();
        assert_eq!(
            fs::read(dir.path().join("frames/frame-1-7.raw")).unwrap(),
            vec![1u8, 2, 3]
        );
    }
}
