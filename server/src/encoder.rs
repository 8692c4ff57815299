use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::{ImageBuffer, Rgb};
use webcam_stream_common::planes::Nv21Buffer;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("NV21 buffer is {got} bytes, expected {expected} for {width}x{height}")]
    BadBuffer {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Still-image compressor fed by the frame pipeline.
pub trait FrameEncoder: Send + Sync {
    /// Compress a full frame. `quality` is 0-100; higher trades size for fidelity.
    fn encode(&self, frame: &Nv21Buffer, quality: u8) -> Result<Vec<u8>, EncodeError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Baseline JPEG via the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegEncoder;

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &Nv21Buffer, quality: u8) -> Result<Vec<u8>, EncodeError> {
        let rgb = nv21_to_rgb(frame)?;
        let (width, height) = (frame.width, frame.height);
        let got = rgb.len();
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(width, height, rgb).ok_or(EncodeError::BadBuffer {
                width,
                height,
                expected: width as usize * height as usize * 3,
                got,
            })?;

        let mut jpeg = Vec::with_capacity(frame.data.len() / 4);
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
        encoder.encode_image(&img)?;
        Ok(jpeg)
    }

    fn name(&self) -> &str {
        "jpeg"
    }
}

/// Expand NV21 to packed RGB using full-range BT.601 coefficients (fixed point, 8 bits).
pub fn nv21_to_rgb(frame: &Nv21Buffer) -> Result<Vec<u8>, EncodeError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let expected = webcam_stream_common::planes::nv21_len(w, h);
    if w % 2 != 0 || h % 2 != 0 || frame.data.len() != expected {
        return Err(EncodeError::BadBuffer {
            width: frame.width,
            height: frame.height,
            expected,
            got: frame.data.len(),
        });
    }

    let (luma, chroma) = frame.data.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let chroma_row = &chroma[(row / 2) * w..(row / 2 + 1) * w];
        for col in 0..w {
            let y = luma[row * w + col] as i32;
            let pair = (col / 2) * 2;
            let v = chroma_row[pair] as i32 - 128;
            let u = chroma_row[pair + 1] as i32 - 128;

            let r = y + ((359 * v) >> 8);
            let g = y - ((88 * u + 183 * v) >> 8);
            let b = y + ((454 * u) >> 8);
            rgb.extend_from_slice(&[clamp_u8(r), clamp_u8(g), clamp_u8(b)]);
        }
    }
    Ok(rgb)
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Nv21Buffer {
        let luma = width as usize * height as usize;
        let mut data = vec![y; luma];
        for _ in 0..luma / 4 {
            data.push(v);
            data.push(u);
        }
        Nv21Buffer {
            data,
            width,
            height,
        }
    }

    #[test]
    fn neutral_chroma_is_gray() {
        let rgb = nv21_to_rgb(&solid(4, 2, 120, 128, 128)).unwrap();
        assert_eq!(rgb.len(), 4 * 2 * 3);
        assert!(rgb.iter().all(|&c| c == 120));
    }

    #[test]
    fn reads_v_before_u() {
        // Strong V (red difference), neutral U: red channel must dominate.
        let rgb = nv21_to_rgb(&solid(2, 2, 100, 128, 240)).unwrap();
        let (r, g, b) = (rgb[0], rgb[1], rgb[2]);
        assert!(r > 200, "r = {r}");
        assert!(g < 100, "g = {g}");
        assert_eq!(b, 100);
    }

    #[test]
    fn rejects_wrong_length() {
        let mut frame = solid(4, 4, 0, 128, 128);
        frame.data.pop();
        assert!(matches!(
            nv21_to_rgb(&frame),
            Err(EncodeError::BadBuffer { expected: 24, got: 23, .. })
        ));
    }

    #[test]
    fn produces_decodable_jpeg() {
        let frame = solid(32, 16, 200, 90, 160);
        let jpeg = JpegEncoder.encode(&frame, 75).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn quality_zero_is_accepted() {
        let frame = solid(8, 8, 50, 128, 128);
        assert!(JpegEncoder.encode(&frame, 0).is_ok());
    }

    #[test]
    fn higher_quality_is_larger() {
        // Noisy luma so quantisation actually matters.
        let mut frame = solid(64, 64, 0, 128, 128);
        for (i, px) in frame.data[..64 * 64].iter_mut().enumerate() {
            *px = ((i * 37) ^ (i >> 3)) as u8;
        }
        let low = JpegEncoder.encode(&frame, 10).unwrap();
        let high = JpegEncoder.encode(&frame, 95).unwrap();
        assert!(high.len() > low.len());
    }
}
