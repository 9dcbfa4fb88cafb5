//! Plane placement on the active mode.
//!
//! Displayed streams are tiled into at most a 2x2 grid, in ascending
//! stream order: slot 0 top-left, 1 top-right, 2 bottom-left, 3
//! bottom-right. A buffer larger than its cell is center-cropped; the
//! visible region is pinned to the cell's outer corner.

use crate::capture::{PixelFormat, StreamInfo};
use crate::{Error, Result};

pub const MAX_PLANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    /// Crop box inside the framebuffer.
    pub src: Rect,
    /// Placement on the CRTC.
    pub dst: Rect,
}

/// Size and format of the scanout buffers backing a displayed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

pub fn buffer_shape(info: &StreamInfo) -> Result<BufferShape> {
    let format = info.format.display_format().ok_or_else(|| {
        Error::config(format!(
            "{}: format {} cannot be displayed",
            info.device, info.format
        ))
    })?;

    let (mut width, mut height) = (info.width, info.height);

    // Embedded data lines are very wide and a few pixels high; fold them
    // into something a plane can scan out.
    if info.embedded {
        let mut div = 1;
        for d in [16, 8, 4, 2, 1] {
            if (info.width / d) % 2 == 0 {
                div = d;
                break;
            }
        }
        width = info.width / div;
        height = info.height * div;
    }

    if width == 0 || height == 0 {
        return Err(Error::config(format!(
            "{}: empty display buffer {}x{}",
            info.device, width, height
        )));
    }

    Ok(BufferShape {
        width,
        height,
        format,
    })
}

/// Geometry of grid slot `slot` when `count` planes share a `mode` sized screen.
pub fn plane_geometry(
    buffer: (u32, u32),
    mode: (u32, u32),
    slot: usize,
    count: usize,
) -> Result<PlaneGeometry> {
    if count == 0 || count > MAX_PLANES || slot >= count {
        return Err(Error::config(format!(
            "cannot place plane {} of {} (at most {} planes)",
            slot, count, MAX_PLANES
        )));
    }

    let (buf_w, buf_h) = buffer;
    let (mode_w, mode_h) = mode;

    let max_w = mode_w / if count == 1 { 1 } else { 2 };
    let max_h = mode_h / if count <= 2 { 1 } else { 2 };

    let w = buf_w.min(max_w);
    let h = buf_h.min(max_h);

    let src = Rect {
        x: (buf_w - w) / 2,
        y: (buf_h - h) / 2,
        w,
        h,
    };

    let dst = Rect {
        x: if slot % 2 == 0 { 0 } else { mode_w - w },
        y: if slot / 2 == 0 { 0 } else { mode_h - h },
        w,
        h,
    };

    Ok(PlaneGeometry { src, dst })
}
