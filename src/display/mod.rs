pub mod compositor;
pub mod kms;
pub mod layout;

use std::os::fd::{OwnedFd, RawFd};

pub use compositor::DisplayCompositor;
pub use kms::KmsDisplay;
pub use layout::{PlaneGeometry, Rect};

use crate::capture::PixelFormat;
use crate::Result;

/// Hardware plane reserved from the display device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneId(pub u32);

/// Scanout framebuffer registered with the display device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FbId(pub u32);

/// A framebuffer allocated by the display device, optionally exported as a
/// DMA-BUF so a capture device can write into it directly.
#[derive(Debug)]
pub struct DisplayBuffer {
    pub fb: FbId,
    pub dmabuf: Option<OwnedFd>,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Blocking commit that lights up connector, CRTC and every plane.
    Modeset,
    /// Non-blocking page flip, completion arrives as an event.
    Flip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneAssignment {
    pub plane: PlaneId,
    pub fb: FbId,
    /// Full plane programming, only carried by the modeset commit.
    pub geometry: Option<PlaneGeometry>,
}

/// Plane updates applied indivisibly by a single commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    assignments: Vec<PlaneAssignment>,
}

impl Transaction {
    pub fn add(&mut self, assignment: PlaneAssignment) {
        self.assignments.push(assignment);
    }

    pub fn assignments(&self) -> &[PlaneAssignment] {
        &self.assignments
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    FlipComplete,
    Other,
}

/// Display capability consumed by [`DisplayCompositor`].
pub trait DisplayDevice {
    fn name(&self) -> &str;

    /// Active mode size in pixels.
    fn mode_size(&self) -> (u32, u32);

    fn reserve_plane(&mut self, format: PixelFormat) -> Result<PlaneId>;

    fn allocate_buffers(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<DisplayBuffer>>;

    fn build_transaction(&self) -> Transaction {
        Transaction::default()
    }

    fn commit(&mut self, transaction: &Transaction, mode: CommitMode) -> Result<()>;

    fn read_completion_events(&mut self) -> Result<Vec<DisplayEvent>>;

    fn readiness_fd(&self) -> RawFd;
}
