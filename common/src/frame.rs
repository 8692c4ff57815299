use bytes::Bytes;

/// A compressed still image published to viewers.
///
/// Immutable once created. Cloning is cheap: every clone shares the same
/// underlying buffer, so a frame can be handed to any number of readers.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    data: Bytes,
    pub captured_at_ms: i64,
    /// Publish sequence number, strictly increasing per broker, starting at 1.
    pub seq: u64,
}

impl EncodedFrame {
    pub fn new(jpeg_data: impl Into<Bytes>, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data: jpeg_data.into(),
            captured_at_ms,
            seq,
        }
    }

    pub fn jpeg_data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a handle to the payload without copying it.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File name for saving this frame to disk.
    /// e.g. "frames/20260218T093000000Z_000007.jpg"
    pub fn file_name(&self, prefix: &str) -> String {
        let dt = chrono::DateTime::from_timestamp_millis(self.captured_at_ms)
            .unwrap_or_else(chrono::Utc::now);
        let ts = dt.format("%Y%m%dT%H%M%S%3fZ");
        format!("{prefix}{ts}_{seq:06}.jpg", seq = self.seq)
    }
}
