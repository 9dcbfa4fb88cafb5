//! DRM/KMS display driven through atomic commits

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use drm::buffer::{Buffer as _, DrmFourcc};
use drm::control::atomic::AtomicModeReq;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as ControlDevice,
    Event, FbCmd2Flags, Mode, ModeTypeFlags, RawResourceHandle, ResourceHandle,
};
use drm::ClientCapability;
use tracing::{debug, info, instrument};

use crate::capture::PixelFormat;
use crate::display::{
    CommitMode, DisplayBuffer, DisplayDevice, DisplayEvent, FbId, PlaneId, Transaction,
};
use crate::{Error, Result};

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

fn drm_format(format: PixelFormat) -> Option<DrmFourcc> {
    match format {
        PixelFormat::Yuyv => Some(DrmFourcc::Yuyv),
        PixelFormat::Uyvy => Some(DrmFourcc::Uyvy),
        PixelFormat::Rgb565 => Some(DrmFourcc::Rgb565),
        // V4L2 names byte order, DRM names little-endian word order.
        PixelFormat::Rgb24 => Some(DrmFourcc::Bgr888),
        PixelFormat::Bgr24 => Some(DrmFourcc::Rgb888),
        PixelFormat::Xbgr32 => Some(DrmFourcc::Xrgb8888),
        PixelFormat::Grey => Some(DrmFourcc::R8),
        _ => None,
    }
}

/// Atomic KMS output on the first connected connector
pub struct KmsDisplay {
    card: Card,
    path: String,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    mode_blob: u64,
    /// Planes usable on our CRTC, in id order.
    planes: Vec<plane::Handle>,
    reserved: Vec<plane::Handle>,
    dumb: Vec<DumbBuffer>,
    framebuffers: Vec<framebuffer::Handle>,
    props: HashMap<RawResourceHandle, HashMap<String, property::Handle>>,
}

impl KmsDisplay {
    #[instrument]
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::device(path, e))?;
        let card = Card(file);
        let err = |e: io::Error| Error::device(path, e);

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(err)?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .map_err(err)?;

        let res = card.resource_handles().map_err(err)?;

        let conn = res
            .connectors()
            .iter()
            .filter_map(|&h| card.get_connector(h, true).ok())
            .find(|c| c.state() == connector::State::Connected && !c.modes().is_empty())
            .ok_or_else(|| Error::config(format!("{}: no connected display", path)))?;

        let mode = conn
            .modes()
            .iter()
            .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
            .copied()
            .unwrap_or(conn.modes()[0]);

        let crtc = conn
            .encoders()
            .iter()
            .filter_map(|&e| card.get_encoder(e).ok())
            .flat_map(|enc| res.filter_crtcs(enc.possible_crtcs()))
            .next()
            .ok_or_else(|| Error::config(format!("{}: no CRTC for connector", path)))?;

        let planes: Vec<plane::Handle> = card
            .plane_handles()
            .map_err(err)?
            .into_iter()
            .filter(|&p| {
                card.get_plane(p)
                    .map(|info| res.filter_crtcs(info.possible_crtcs()).contains(&crtc))
                    .unwrap_or(false)
            })
            .collect();

        let mode_blob = match card.create_property_blob(&mode).map_err(err)? {
            property::Value::Blob(id) => id,
            other => {
                return Err(Error::assertion(format!(
                    "mode blob came back as {:?}",
                    other
                )))
            }
        };

        let (w, h) = mode.size();
        info!(
            "{}: {:?} {}x{}@{} on {:?}, {} planes",
            path,
            conn.interface(),
            w,
            h,
            mode.vrefresh(),
            crtc,
            planes.len()
        );

        let mut display = Self {
            card,
            path: path.to_string(),
            connector: conn.handle(),
            crtc,
            mode,
            mode_blob,
            planes,
            reserved: Vec::new(),
            dumb: Vec::new(),
            framebuffers: Vec::new(),
            props: HashMap::new(),
        };

        display.load_props(display.connector)?;
        display.load_props(display.crtc)?;
        for plane in display.planes.clone() {
            display.load_props(plane)?;
        }

        Ok(display)
    }

    fn load_props<H: ResourceHandle>(&mut self, handle: H) -> Result<()> {
        let values = self
            .card
            .get_properties(handle)
            .map_err(|e| Error::device(self.path.clone(), e))?;
        let named = values
            .as_hashmap(&self.card)
            .map_err(|e| Error::device(self.path.clone(), e))?;
        let by_name = named
            .into_iter()
            .map(|(name, info)| (name, info.handle()))
            .collect();
        self.props.insert(handle.into(), by_name);
        Ok(())
    }

    fn prop<H: ResourceHandle>(&self, handle: H, name: &str) -> Result<property::Handle> {
        let raw: RawResourceHandle = handle.into();
        self.props
            .get(&raw)
            .and_then(|props| props.get(name))
            .copied()
            .ok_or_else(|| Error::config(format!("{}: object has no {} property", self.path, name)))
    }

    fn plane_handle(&self, id: PlaneId) -> Result<plane::Handle> {
        self.reserved
            .get(id.0 as usize)
            .copied()
            .ok_or_else(|| Error::assertion(format!("unknown plane {:?}", id)))
    }

    fn fb_handle(&self, id: FbId) -> Result<framebuffer::Handle> {
        self.framebuffers
            .get(id.0 as usize)
            .copied()
            .ok_or_else(|| Error::assertion(format!("unknown framebuffer {:?}", id)))
    }

    fn build_request(&self, txn: &Transaction, mode: CommitMode) -> Result<AtomicModeReq> {
        let mut req = AtomicModeReq::new();

        if mode == CommitMode::Modeset {
            req.add_property(
                self.connector,
                self.prop(self.connector, "CRTC_ID")?,
                property::Value::CRTC(Some(self.crtc)),
            );
            req.add_property(
                self.crtc,
                self.prop(self.crtc, "MODE_ID")?,
                property::Value::Blob(self.mode_blob),
            );
            req.add_property(
                self.crtc,
                self.prop(self.crtc, "ACTIVE")?,
                property::Value::Boolean(true),
            );

            // Anything left on from a previous client goes dark.
            for &plane in self.planes.iter().filter(|p| !self.reserved.contains(p)) {
                req.add_property(
                    plane,
                    self.prop(plane, "FB_ID")?,
                    property::Value::Framebuffer(None),
                );
                req.add_property(
                    plane,
                    self.prop(plane, "CRTC_ID")?,
                    property::Value::CRTC(None),
                );
            }
        }

        for assignment in txn.assignments() {
            let plane = self.plane_handle(assignment.plane)?;
            let fb = self.fb_handle(assignment.fb)?;

            req.add_property(
                plane,
                self.prop(plane, "FB_ID")?,
                property::Value::Framebuffer(Some(fb)),
            );

            if let Some(geometry) = assignment.geometry {
                let (src, dst) = (geometry.src, geometry.dst);
                req.add_property(
                    plane,
                    self.prop(plane, "CRTC_ID")?,
                    property::Value::CRTC(Some(self.crtc)),
                );
                // Source coordinates are 16.16 fixed point.
                for (name, value) in [
                    ("SRC_X", src.x),
                    ("SRC_Y", src.y),
                    ("SRC_W", src.w),
                    ("SRC_H", src.h),
                ] {
                    req.add_property(
                        plane,
                        self.prop(plane, name)?,
                        property::Value::UnsignedRange(u64::from(value) << 16),
                    );
                }
                for (name, value) in [("CRTC_X", dst.x), ("CRTC_Y", dst.y)] {
                    req.add_property(
                        plane,
                        self.prop(plane, name)?,
                        property::Value::SignedRange(i64::from(value)),
                    );
                }
                for (name, value) in [("CRTC_W", dst.w), ("CRTC_H", dst.h)] {
                    req.add_property(
                        plane,
                        self.prop(plane, name)?,
                        property::Value::UnsignedRange(u64::from(value)),
                    );
                }
            }
        }

        Ok(req)
    }
}

impl DisplayDevice for KmsDisplay {
    fn name(&self) -> &str {
        &self.path
    }

    fn mode_size(&self) -> (u32, u32) {
        let (w, h) = self.mode.size();
        (u32::from(w), u32::from(h))
    }

    fn reserve_plane(&mut self, format: PixelFormat) -> Result<PlaneId> {
        let fourcc = drm_format(format)
            .ok_or_else(|| Error::config(format!("{} has no scanout format", format)))?;

        let plane = self
            .planes
            .iter()
            .copied()
            .filter(|p| !self.reserved.contains(p))
            .find(|&p| {
                self.card
                    .get_plane(p)
                    .map(|info| info.formats().contains(&(fourcc as u32)))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                Error::config(format!("{}: no free plane supports {}", self.path, format))
            })?;

        self.reserved.push(plane);
        debug!(?plane, %format, "plane reserved");
        Ok(PlaneId((self.reserved.len() - 1) as u32))
    }

    fn allocate_buffers(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<DisplayBuffer>> {
        let fourcc = drm_format(format)
            .ok_or_else(|| Error::config(format!("{} has no scanout format", format)))?;
        let err = |e: io::Error| Error::device(self.path.clone(), e);

        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            let dumb = self
                .card
                .create_dumb_buffer((width, height), fourcc, format.bits_per_pixel())
                .map_err(err)?;
            let fb = self
                .card
                .add_planar_framebuffer(&dumb, FbCmd2Flags::empty())
                .map_err(err)?;
            let dmabuf = self
                .card
                .buffer_to_prime_fd(dumb.handle(), (libc::O_CLOEXEC | libc::O_RDWR) as u32)
                .map_err(err)?;
            let len = (dumb.pitch() * height) as usize;

            self.dumb.push(dumb);
            self.framebuffers.push(fb);
            buffers.push(DisplayBuffer {
                fb: FbId((self.framebuffers.len() - 1) as u32),
                dmabuf: Some(dmabuf),
                len,
            });
        }

        Ok(buffers)
    }

    fn commit(&mut self, transaction: &Transaction, mode: CommitMode) -> Result<()> {
        let req = self.build_request(transaction, mode)?;
        let flags = match mode {
            CommitMode::Modeset => AtomicCommitFlags::ALLOW_MODESET,
            CommitMode::Flip => AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT,
        };
        self.card
            .atomic_commit(flags, req)
            .map_err(|e| Error::device(self.path.clone(), e))
    }

    fn read_completion_events(&mut self) -> Result<Vec<DisplayEvent>> {
        let events = self
            .card
            .receive_events()
            .map_err(|e| Error::device(self.path.clone(), e))?;
        Ok(events
            .map(|event| match event {
                Event::PageFlip(_) => DisplayEvent::FlipComplete,
                _ => DisplayEvent::Other,
            })
            .collect())
    }

    fn readiness_fd(&self) -> RawFd {
        self.card.0.as_raw_fd()
    }
}

impl Drop for KmsDisplay {
    fn drop(&mut self) {
        for fb in self.framebuffers.drain(..) {
            let _ = self.card.destroy_framebuffer(fb);
        }
        for dumb in self.dumb.drain(..) {
            let _ = self.card.destroy_dumb_buffer(dumb);
        }
    }
}
