//! Planar 4:2:0 frames as delivered by camera devices, and their conversion
//! to a tightly packed NV21 buffer for still-image encoders.
//!
//! Devices hand out three plane views (Y, U, V) whose rows may be padded
//! (`row_stride > width * pixel_stride`) and whose chroma samples may be
//! interleaved with the other chroma channel (`pixel_stride == 2`, the
//! semi-planar layout most Android HALs use). The converter discards padding
//! and writes chroma as (V, U) pairs.

use std::fmt;

/// Format tag attached to a raw frame by the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Planar or semi-planar YUV 4:2:0 with per-plane strides.
    Yuv420,
    Nv21,
    Rgba8888,
    Jpeg,
    Other(u32),
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Yuv420 => f.write_str("YUV_420"),
            FrameFormat::Nv21 => f.write_str("NV21"),
            FrameFormat::Rgba8888 => f.write_str("RGBA_8888"),
            FrameFormat::Jpeg => f.write_str("JPEG"),
            FrameFormat::Other(tag) => write!(f, "0x{tag:x}"),
        }
    }
}

/// Which plane of a raw frame an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Y,
    U,
    V,
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Plane::Y => "Y",
            Plane::U => "U",
            Plane::V => "V",
        })
    }
}

/// A borrowed view of one color plane.
#[derive(Debug, Clone, Copy)]
pub struct PlaneDescriptor<'a> {
    pub data: &'a [u8],
    /// Bytes between the starts of consecutive rows.
    pub row_stride: usize,
    /// Bytes between consecutive samples within a row.
    pub pixel_stride: usize,
    pub width: usize,
    pub height: usize,
}

impl<'a> PlaneDescriptor<'a> {
    pub fn new(
        data: &'a [u8],
        row_stride: usize,
        pixel_stride: usize,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
            width,
            height,
        }
    }

    /// Smallest buffer length that still holds the last sample of the last row.
    /// The final row may stop short of its full stride. `None` on overflow.
    fn required_len(&self) -> Option<usize> {
        let last_row = (self.height - 1).checked_mul(self.row_stride)?;
        let last_sample = (self.width - 1).checked_mul(self.pixel_stride)?;
        last_row.checked_add(last_sample)?.checked_add(1)
    }

    fn validate(&self, plane: Plane) -> Result<(), ConvertError> {
        let invalid_stride = || ConvertError::InvalidStride {
            plane,
            row_stride: self.row_stride,
            pixel_stride: self.pixel_stride,
            width: self.width,
        };
        let min_row = self
            .width
            .checked_mul(self.pixel_stride)
            .ok_or_else(invalid_stride)?;
        if self.pixel_stride == 0 || self.row_stride < min_row {
            return Err(invalid_stride());
        }
        // A length that does not fit in usize cannot be backed by any buffer.
        let needed = self.required_len().unwrap_or(usize::MAX);
        if self.data.len() < needed {
            return Err(ConvertError::PlaneTooShort {
                plane,
                needed,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    /// Samples of row `row`, bounded to `min(row_stride, bytes_remaining)`.
    /// Only called after `validate`, so the row start is in bounds.
    fn row(&self, row: usize) -> &'a [u8] {
        let start = row * self.row_stride;
        let end = start.saturating_add(self.row_stride).min(self.data.len());
        &self.data[start..end]
    }
}

/// One captured frame: a format tag and exactly three planes.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub format: FrameFormat,
    pub y: PlaneDescriptor<'a>,
    pub u: PlaneDescriptor<'a>,
    pub v: PlaneDescriptor<'a>,
}

impl<'a> RawFrame<'a> {
    pub fn new(
        format: FrameFormat,
        y: PlaneDescriptor<'a>,
        u: PlaneDescriptor<'a>,
        v: PlaneDescriptor<'a>,
    ) -> Self {
        Self { format, y, u, v }
    }

    pub fn width(&self) -> usize {
        self.y.width
    }

    pub fn height(&self) -> usize {
        self.y.height
    }
}

/// Contiguous NV21 image: `width * height` luma bytes followed by
/// `(width / 2) * (height / 2)` interleaved (V, U) pairs. No padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nv21Buffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Nv21Buffer {
    pub fn luma(&self) -> &[u8] {
        &self.data[..self.width as usize * self.height as usize]
    }

    pub fn chroma(&self) -> &[u8] {
        &self.data[self.width as usize * self.height as usize..]
    }
}

/// Size in bytes of an NV21 buffer for the given (even) dimensions.
pub fn nv21_len(width: usize, height: usize) -> usize {
    width * height + 2 * (width / 2) * (height / 2)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("unsupported frame format {0}, expected YUV_420")]
    UnsupportedFormat(FrameFormat),
    #[error("frame dimensions must be even and non-zero, got {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
    #[error("{plane} plane is {got_width}x{got_height}, expected {width}x{height}")]
    ChromaGeometry {
        plane: Plane,
        width: usize,
        height: usize,
        got_width: usize,
        got_height: usize,
    },
    #[error(
        "{plane} plane has row stride {row_stride} and pixel stride {pixel_stride}, \
         too small for width {width}"
    )]
    InvalidStride {
        plane: Plane,
        row_stride: usize,
        pixel_stride: usize,
        width: usize,
    },
    #[error("{plane} plane buffer too short: got {got} bytes, need at least {needed}")]
    PlaneTooShort {
        plane: Plane,
        needed: usize,
        got: usize,
    },
}

/// Convert a planar 4:2:0 frame into a tightly packed NV21 buffer.
pub fn yuv420_to_nv21(frame: &RawFrame<'_>) -> Result<Nv21Buffer, ConvertError> {
    if frame.format != FrameFormat::Yuv420 {
        return Err(ConvertError::UnsupportedFormat(frame.format));
    }

    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(ConvertError::InvalidDimensions { width, height });
    }
    let (chroma_width, chroma_height) = (width / 2, height / 2);

    for (plane, desc) in [(Plane::U, &frame.u), (Plane::V, &frame.v)] {
        if desc.width != chroma_width || desc.height != chroma_height {
            return Err(ConvertError::ChromaGeometry {
                plane,
                width: chroma_width,
                height: chroma_height,
                got_width: desc.width,
                got_height: desc.height,
            });
        }
    }
    frame.y.validate(Plane::Y)?;
    frame.u.validate(Plane::U)?;
    frame.v.validate(Plane::V)?;

    let mut out = Vec::with_capacity(nv21_len(width, height));
    copy_luma(&frame.y, &mut out);
    interleave_chroma(&frame.u, &frame.v, &mut out);

    Ok(Nv21Buffer {
        data: out,
        width: width as u32,
        height: height as u32,
    })
}

fn copy_luma(y: &PlaneDescriptor<'_>, out: &mut Vec<u8>) {
    for row in 0..y.height {
        let line = y.row(row);
        if y.pixel_stride == 1 {
            out.extend_from_slice(&line[..y.width]);
        } else {
            out.extend(line.iter().step_by(y.pixel_stride).take(y.width));
        }
    }
}

/// Writes chroma as (V, U) pairs. Encoders reading NV21 depend on this order.
fn interleave_chroma(u: &PlaneDescriptor<'_>, v: &PlaneDescriptor<'_>, out: &mut Vec<u8>) {
    for row in 0..u.height {
        let u_samples = u.row(row).iter().step_by(u.pixel_stride);
        let v_samples = v.row(row).iter().step_by(v.pixel_stride);
        for (&v_sample, &u_sample) in v_samples.zip(u_samples).take(u.width) {
            out.push(v_sample);
            out.push(u_sample);
        }
    }
}
