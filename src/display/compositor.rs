//! Atomic page-flip scheduling for the displayed streams.
//!
//! Each displayed stream owns one plane for the life of the process. A
//! buffer handed to the compositor walks `pending -> on-screen -> retiring`
//! and is returned to its capture queue once the flip that replaced it
//! has completed. At most one flip is in flight; frames arriving meanwhile
//! wait in the per-stream pending queue and are batched into the next
//! commit.

use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info, instrument, trace, warn};

use crate::capture::{BufferRequest, FrameBuffer, ImportedBuffer, StreamInfo};
use crate::display::layout::{self, PlaneGeometry};
use crate::display::{
    CommitMode, DisplayBuffer, DisplayDevice, DisplayEvent, FbId, PlaneAssignment, PlaneId,
};
use crate::{Backpressure, Error, Result, StreamIndex};

/// Display state of one stream.
#[derive(Debug)]
pub struct DisplayPlane {
    stream: StreamIndex,
    plane: PlaneId,
    geometry: PlaneGeometry,
    framebuffers: Vec<DisplayBuffer>,
    on_screen: Option<FrameBuffer>,
    retiring: Option<FrameBuffer>,
    pending: VecDeque<FrameBuffer>,
    bound: usize,
    backpressure_events: u64,
}

impl DisplayPlane {
    pub fn stream(&self) -> StreamIndex {
        self.stream
    }

    pub fn plane(&self) -> PlaneId {
        self.plane
    }

    pub fn geometry(&self) -> PlaneGeometry {
        self.geometry
    }

    pub fn pending_depth(&self) -> usize {
        self.pending.len()
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events
    }

    fn fb(&self, buf: &FrameBuffer) -> Result<FbId> {
        self.framebuffers
            .get(buf.index())
            .map(|b| b.fb)
            .ok_or_else(|| {
                Error::assertion(format!(
                    "stream {}: buffer {} has no framebuffer",
                    self.stream,
                    buf.index()
                ))
            })
    }

    /// Buffers of this stream currently owned by the display side.
    fn held(&self) -> usize {
        self.pending.len()
            + usize::from(self.on_screen.is_some())
            + usize::from(self.retiring.is_some())
    }
}

pub struct DisplayCompositor {
    device: Box<dyn DisplayDevice>,
    planes: Vec<DisplayPlane>,
    modeset_done: bool,
    flip_in_flight: bool,
    flips_issued: u64,
    flips_completed: u64,
}

impl DisplayCompositor {
    pub fn new(device: Box<dyn DisplayDevice>) -> Self {
        Self {
            device,
            planes: Vec::new(),
            modeset_done: false,
            flip_in_flight: false,
            flips_issued: 0,
            flips_completed: 0,
        }
    }

    /// Bind a plane to every displayed stream, compute its geometry and
    /// allocate its scanout buffers. Returns, per stream and in the same
    /// order, how the capture pool must be reserved.
    #[instrument(skip_all, fields(device = self.device.name()))]
    pub fn add_planes(&mut self, streams: &[&StreamInfo]) -> Result<Vec<BufferRequest>> {
        if self.modeset_done || !self.planes.is_empty() {
            return Err(Error::assertion("planes must be bound once, before modeset"));
        }

        let mut ordered: Vec<&StreamInfo> = streams.to_vec();
        ordered.sort_by_key(|s| s.index);
        if ordered.windows(2).any(|w| w[0].index == w[1].index) {
            return Err(Error::config("stream displayed twice"));
        }

        let mode = self.device.mode_size();
        let count = ordered.len();
        let mut requests = Vec::with_capacity(count);

        for (slot, info) in ordered.iter().enumerate() {
            if info.buffer_count < 2 {
                return Err(Error::config(format!(
                    "{}: a displayed stream needs at least 2 buffers",
                    info.device
                )));
            }

            let shape = layout::buffer_shape(info)?;
            let geometry = layout::plane_geometry((shape.width, shape.height), mode, slot, count)?;
            let plane = self.device.reserve_plane(shape.format)?;
            let framebuffers = self.device.allocate_buffers(
                shape.format,
                shape.width,
                shape.height,
                info.buffer_count,
            )?;

            info!(
                stream = info.index,
                plane = plane.0,
                "{}x{} {} src {:?} dst {:?}",
                shape.width,
                shape.height,
                shape.format,
                geometry.src,
                geometry.dst
            );

            let imported: Vec<ImportedBuffer> = framebuffers
                .iter()
                .filter_map(|b| {
                    b.dmabuf.as_ref().map(|fd| ImportedBuffer {
                        fd: fd.as_raw_fd(),
                        len: b.len,
                    })
                })
                .collect();

            let request = if imported.len() == framebuffers.len() {
                BufferRequest::DmaBuf(imported)
            } else {
                BufferRequest::Mmap(info.buffer_count)
            };

            self.planes.push(DisplayPlane {
                stream: info.index,
                plane,
                geometry,
                framebuffers,
                on_screen: None,
                retiring: None,
                pending: VecDeque::new(),
                bound: info.buffer_count - 1,
                backpressure_events: 0,
            });
            requests.push((info.index, request));
        }

        // Hand requests back in caller order.
        Ok(streams
            .iter()
            .filter_map(|s| {
                requests
                    .iter()
                    .position(|(idx, _)| *idx == s.index)
                    .map(|pos| requests[pos].1.clone())
            })
            .collect())
    }

    /// Blocking modeset that puts `initial` on screen. Issued exactly once,
    /// before any flip.
    #[instrument(skip_all, fields(device = self.device.name()))]
    pub fn modeset(&mut self, initial: Vec<FrameBuffer>) -> Result<()> {
        if self.modeset_done {
            return Err(Error::assertion("modeset already committed"));
        }

        for buf in initial {
            let plane = self.plane_mut(buf.stream())?;
            if plane.on_screen.is_some() {
                return Err(Error::assertion(format!(
                    "stream {}: two initial buffers",
                    plane.stream
                )));
            }
            plane.on_screen = Some(buf);
        }

        let mut txn = self.device.build_transaction();
        for plane in &self.planes {
            let buf = plane.on_screen.as_ref().ok_or_else(|| {
                Error::assertion(format!("stream {}: no initial buffer", plane.stream))
            })?;
            txn.add(PlaneAssignment {
                plane: plane.plane,
                fb: plane.fb(buf)?,
                geometry: Some(plane.geometry),
            });
        }

        self.device.commit(&txn, CommitMode::Modeset)?;
        self.modeset_done = true;
        info!(planes = txn.len(), "modeset committed");
        Ok(())
    }

    /// Append a captured frame to its stream's pending queue.
    pub fn enqueue(&mut self, buf: FrameBuffer) -> Result<Option<Backpressure>> {
        let plane = self.plane_mut(buf.stream())?;
        plane.pending.push_back(buf);

        let depth = plane.pending.len();
        metrics::gauge!("pending_depth", "stream" => plane.stream.to_string()).set(depth as f64);

        if depth < plane.bound {
            return Ok(None);
        }

        plane.backpressure_events += 1;
        metrics::counter!("backpressure_events", "stream" => plane.stream.to_string())
            .increment(1);
        warn!(
            stream = plane.stream,
            depth,
            bound = plane.bound,
            "pending queue saturated, display is falling behind"
        );
        Ok(Some(Backpressure {
            stream: plane.stream,
            depth,
            bound: plane.bound,
        }))
    }

    /// Issue one non-blocking commit swapping every plane in `updates`.
    ///
    /// The buffer each update replaces moves to retiring and is handed back
    /// by [`complete_flips`](Self::complete_flips).
    pub fn flip(&mut self, updates: BTreeMap<StreamIndex, FrameBuffer>) -> Result<()> {
        if !self.modeset_done {
            return Err(Error::assertion("flip before modeset"));
        }
        if self.flip_in_flight {
            return Err(Error::assertion("flip while another flip is outstanding"));
        }
        if updates.is_empty() {
            return Ok(());
        }

        let mut txn = self.device.build_transaction();
        for (&stream, buf) in &updates {
            if buf.stream() != stream {
                return Err(Error::assertion(format!(
                    "buffer of stream {} offered for stream {}",
                    buf.stream(),
                    stream
                )));
            }
            let plane = self.plane(stream)?;
            if plane.retiring.is_some() {
                return Err(Error::assertion(format!(
                    "stream {}: previous buffer not yet retired",
                    stream
                )));
            }
            txn.add(PlaneAssignment {
                plane: plane.plane,
                fb: plane.fb(buf)?,
                geometry: None,
            });
        }

        for (stream, buf) in updates {
            let plane = self.plane_mut(stream)?;
            plane.retiring = plane.on_screen.replace(buf);
        }

        self.device.commit(&txn, CommitMode::Flip)?;
        self.flip_in_flight = true;
        self.flips_issued += 1;
        metrics::counter!("flip_commits").increment(1);
        debug!(planes = txn.len(), "flip committed");
        Ok(())
    }

    /// Flip the oldest pending frame of every stream that has one. Returns
    /// whether a commit was issued.
    pub fn present_pending(&mut self) -> Result<bool> {
        if self.flip_in_flight {
            return Ok(false);
        }

        let updates: BTreeMap<StreamIndex, FrameBuffer> = self
            .planes
            .iter_mut()
            .filter_map(|p| p.pending.pop_front().map(|buf| (p.stream, buf)))
            .collect();

        if updates.is_empty() {
            return Ok(false);
        }

        self.flip(updates)?;
        Ok(true)
    }

    /// Consume completion events and return the buffers retired by the
    /// completed flip.
    pub fn complete_flips(&mut self) -> Result<Vec<FrameBuffer>> {
        let mut retired = Vec::new();

        for event in self.device.read_completion_events()? {
            match event {
                DisplayEvent::FlipComplete => {
                    if !self.flip_in_flight {
                        return Err(Error::assertion("flip completion without outstanding flip"));
                    }
                    self.flip_in_flight = false;
                    self.flips_completed += 1;
                    retired.extend(self.planes.iter_mut().filter_map(|p| p.retiring.take()));
                }
                DisplayEvent::Other => trace!("ignoring display event"),
            }
        }

        Ok(retired)
    }

    pub fn flip_in_flight(&self) -> bool {
        self.flip_in_flight
    }

    pub fn flips_issued(&self) -> u64 {
        self.flips_issued
    }

    pub fn flips_completed(&self) -> u64 {
        self.flips_completed
    }

    pub fn is_displayed(&self, stream: StreamIndex) -> bool {
        self.planes.iter().any(|p| p.stream == stream)
    }

    pub fn planes(&self) -> &[DisplayPlane] {
        &self.planes
    }

    pub fn on_screen(&self, stream: StreamIndex) -> Option<&FrameBuffer> {
        self.plane(stream).ok()?.on_screen.as_ref()
    }

    pub fn pending_depth(&self, stream: StreamIndex) -> usize {
        self.plane(stream).map(|p| p.pending.len()).unwrap_or(0)
    }

    /// Buffers of `stream` owned by pending, on-screen and retiring.
    pub fn held(&self, stream: StreamIndex) -> usize {
        self.plane(stream).map(|p| p.held()).unwrap_or(0)
    }

    pub fn framebuffer(&self, stream: StreamIndex, index: usize) -> Option<FbId> {
        self.plane(stream).ok()?.framebuffers.get(index).map(|b| b.fb)
    }

    pub fn readiness_fd(&self) -> RawFd {
        self.device.readiness_fd()
    }

    fn plane(&self, stream: StreamIndex) -> Result<&DisplayPlane> {
        self.planes
            .iter()
            .find(|p| p.stream == stream)
            .ok_or_else(|| Error::assertion(format!("stream {} is not displayed", stream)))
    }

    fn plane_mut(&mut self, stream: StreamIndex) -> Result<&mut DisplayPlane> {
        self.planes
            .iter_mut()
            .find(|p| p.stream == stream)
            .ok_or_else(|| Error::assertion(format!("stream {} is not displayed", stream)))
    }
}
