use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use webcam_stream_common::config::SourceConfig;
use webcam_stream_common::planes::{FrameFormat, PlaneDescriptor, RawFrame};

/// Synthetic camera: a moving test pattern laid out the way device HALs hand
/// out YUV 4:2:0 buffers.
///
/// Luma rows are padded to `row_alignment`. Chroma lives in one interleaved
/// UV buffer that is exposed as two planes with pixel stride 2, U starting at
/// offset 0 and V at offset 1.
pub struct TestPatternSource {
    width: usize,
    height: usize,
    row_stride: usize,
    interval: Duration,
    luma: Vec<u8>,
    chroma: Vec<u8>,
}

impl TestPatternSource {
    pub fn new(config: &SourceConfig) -> Self {
        let width = config.width as usize;
        let height = config.height as usize;
        let align = config.row_alignment.max(1);
        let row_stride = width.div_ceil(align) * align;
        Self {
            width,
            height,
            row_stride,
            interval: Duration::from_secs_f64(1.0 / config.fps),
            luma: vec![0; row_stride * height],
            // The last chroma row stops after its final V sample, like a real
            // semi-planar buffer whose V view starts one byte in.
            chroma: vec![0; row_stride * (height / 2 - 1) + width],
        }
    }

    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    /// Draw frame number `index` and return a view over it.
    pub fn render(&mut self, index: u64) -> RawFrame<'_> {
        let (w, h, stride) = (self.width, self.height, self.row_stride);
        let shift = (index * 4) as usize;

        // Diagonal luma ramp scrolling right, with a bright bar sweeping down.
        let bar = (index as usize * 2) % h;
        for row in 0..h {
            let line = &mut self.luma[row * stride..row * stride + w];
            for (col, px) in line.iter_mut().enumerate() {
                *px = if row.abs_diff(bar) < 4 {
                    235
                } else {
                    ((col + row + shift) % 220 + 16) as u8
                };
            }
        }

        // Eight vertical color bars, rotating over time.
        let (cw, ch) = (w / 2, h / 2);
        for row in 0..ch {
            let line_start = row * stride;
            for col in 0..cw {
                let bar = (col * 8 / cw.max(1) + index as usize / 15) % 8;
                let (u, v) = BAR_CHROMA[bar];
                self.chroma[line_start + col * 2] = u;
                self.chroma[line_start + col * 2 + 1] = v;
            }
        }

        RawFrame::new(
            FrameFormat::Yuv420,
            PlaneDescriptor::new(&self.luma, stride, 1, w, h),
            PlaneDescriptor::new(&self.chroma, stride, 2, cw, ch),
            PlaneDescriptor::new(&self.chroma[1..], stride, 2, cw, ch),
        )
    }

    /// Run the source on its own thread, handing every frame to `on_frame`.
    pub fn spawn<F>(mut self, mut on_frame: F) -> std::io::Result<SourceHandle>
    where
        F: FnMut(&RawFrame<'_>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                info!(
                    width = self.width,
                    height = self.height,
                    row_stride = self.row_stride(),
                    interval = ?self.interval,
                    "test pattern source started"
                );
                let mut index = 0u64;
                let mut next_due = Instant::now();
                while !stop_flag.load(Ordering::Relaxed) {
                    let interval = self.interval;
                    let frame = self.render(index);
                    on_frame(&frame);
                    index += 1;

                    next_due += interval;
                    let now = Instant::now();
                    if next_due > now {
                        std::thread::sleep(next_due - now);
                    } else {
                        // Running behind: skip ahead instead of bursting.
                        next_due = now;
                    }
                }
                info!(frames = index, "test pattern source stopped");
            })?;
        Ok(SourceHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// (U, V) for white, yellow, cyan, green, magenta, red, blue, black.
const BAR_CHROMA: [(u8, u8); 8] = [
    (128, 128),
    (16, 146),
    (166, 16),
    (54, 34),
    (202, 222),
    (90, 240),
    (240, 110),
    (128, 128),
];

/// Owner of the running source thread.
pub struct SourceHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    /// Ask the source to stop and wait for its thread to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("frame source thread panicked");
            }
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use webcam_stream_common::planes::{nv21_len, yuv420_to_nv21};

    fn config(width: u32, height: u32) -> SourceConfig {
        SourceConfig {
            width,
            height,
            fps: 200.0,
            row_alignment: 64,
        }
    }

    #[test]
    fn rows_are_padded_to_alignment() {
        let source = TestPatternSource::new(&config(100, 20));
        assert_eq!(source.row_stride(), 128);
    }

    #[test]
    fn rendered_frame_converts() {
        let mut source = TestPatternSource::new(&config(100, 20));
        let frame = source.render(3);
        assert_eq!(frame.u.pixel_stride, 2);
        assert_eq!(frame.v.data.len(), frame.u.data.len() - 1);

        let nv21 = yuv420_to_nv21(&frame).unwrap();
        assert_eq!(nv21.data.len(), nv21_len(100, 20));
        // First bar is white: neutral chroma.
        assert_eq!(&nv21.chroma()[..2], &[128, 128]);
    }

    #[test]
    fn v_plane_reads_v_samples() {
        let mut source = TestPatternSource::new(&config(16, 2));
        // Second bar (yellow) covers chroma column 1 at frame 0.
        let frame = source.render(0);
        let nv21 = yuv420_to_nv21(&frame).unwrap();
        let (u, v) = BAR_CHROMA[1];
        assert_eq!(&nv21.chroma()[2..4], &[v, u]);
    }

    #[test]
    fn frames_change_over_time() {
        let mut source = TestPatternSource::new(&config(64, 16));
        let a = yuv420_to_nv21(&source.render(0)).unwrap();
        let b = yuv420_to_nv21(&source.render(1)).unwrap();
        assert_ne!(a.luma(), b.luma());
    }

    #[test]
    fn spawned_source_delivers_frames_until_stopped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = TestPatternSource::new(&config(32, 16))
            .spawn(move |frame| {
                sink.lock().unwrap().push((frame.width(), frame.height()));
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        handle.stop();

        let count = seen.lock().unwrap().len();
        assert!(count > 0);
        assert!(seen.lock().unwrap().iter().all(|&dims| dims == (32, 16)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(seen.lock().unwrap().len(), count);
    }
}
