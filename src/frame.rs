//! The data model shared between the Ingest Path and the Render Loop: a
//! decoded frame, its caps fingerprint, the single-frame Frame Slot, and
//! the pre-allocated Fallback Frame used during starvation.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// No-signal threshold: a Frame Slot whose last write is older than this
/// is considered stale and yields the Fallback Frame instead.
pub const STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(5);

/// Caps fingerprint: format/dimensions/framerate of a Raw Frame's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Caps {
    pub fn new(format: PixelFormat, width: u32, height: u32, fps: u32) -> Self {
        Self {
            format,
            width,
            height,
            fps,
        }
    }

    pub fn frame_size(&self) -> usize {
        // Planar YUV 4:2:0: Y plane (w*h) + 2 chroma planes (w/2*h/2 each).
        let luma = (self.width * self.height) as usize;
        let chroma = (self.width as usize / 2) * (self.height as usize / 2);
        luma + 2 * chroma
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    I420,
}

/// A decoded image in canonical pixel format, owned.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: bytes::Bytes,
    pub caps: Caps,
    pub ingest_seq: u64,
}

impl RawFrame {
    pub fn new(data: bytes::Bytes, caps: Caps, ingest_seq: u64) -> Self {
        Self {
            data,
            caps,
            ingest_seq,
        }
    }
}

/// Pre-allocated neutral-gray frame at the configured output geometry,
/// built once at session start and copied out on every starvation tick.
#[derive(Debug, Clone)]
pub struct FallbackFrame {
    frame: RawFrame,
}

impl FallbackFrame {
    pub fn new(caps: Caps) -> Self {
        // Neutral gray in I420: Y=128, U=V=128.
        let size = caps.frame_size();
        let mut buf = vec![128u8; size];
        let luma = (caps.width * caps.height) as usize;
        buf[..luma].fill(128);
        let data = bytes::Bytes::from(buf);
        Self {
            frame: RawFrame::new(data, caps, 0),
        }
    }

    pub fn copy(&self) -> RawFrame {
        self.frame.clone()
    }

    pub fn caps(&self) -> Caps {
        self.frame.caps
    }
}

/// Result of a Frame Slot read: a frame copy (if fresh) and the slot's
/// staleness at the time of the read.
pub struct Snapshot {
    pub frame: Option<RawFrame>,
    pub is_stale: bool,
}

struct SlotState {
    frame: Option<RawFrame>,
    caps: Option<Caps>,
    last_ingest: Option<Instant>,
}

/// The single-frame buffer. Holds at most one Raw Frame. Single-writer
/// (Ingest Path), single-reader (Render Loop); the mutex bounds every
/// access, and nothing ever escapes it by reference.
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ingest_seq: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                caps: None,
                last_ingest: None,
            }),
            ingest_seq: AtomicU64::new(0),
        }
    }

    /// Replace the held frame. Drops the previous frame reference and
    /// stores the new one atomically with the timestamp/caps update.
    pub fn replace(&self, data: bytes::Bytes, caps: Caps) {
        let seq = self.ingest_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock();
        let frame = RawFrame::new(data, caps, seq);
        state.frame = Some(frame);
        if state.caps != Some(caps) {
            state.caps = Some(caps);
        }
        state.last_ingest = Some(Instant::now());
    }

    /// Copy out the current frame, if present and fresh.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        let is_stale = match state.last_ingest {
            None => true,
            Some(t) => t.elapsed() > STALE_AFTER,
        };
        let frame = if !is_stale {
            state.frame.clone()
        } else {
            None
        };
        Snapshot { frame, is_stale }
    }

    pub fn current_caps(&self) -> Option<Caps> {
        self.state.lock().caps
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_caps() -> Caps {
        Caps::new(PixelFormat::I420, 64, 48, 30)
    }

    #[test]
    fn empty_slot_is_stale_with_no_frame() {
        let slot = FrameSlot::new();
        let snap = slot.snapshot();
        assert!(snap.is_stale);
        assert!(snap.frame.is_none());
    }

    #[test]
    fn replace_then_snapshot_returns_fresh_frame() {
        let slot = FrameSlot::new();
        let caps = test_caps();
        slot.replace(bytes::Bytes::from_static(b"abc"), caps);
        let snap = slot.snapshot();
        assert!(!snap.is_stale);
        let frame = snap.frame.expect("frame present");
        assert_eq!(frame.ingest_seq, 1);
        assert_eq!(frame.caps, caps);
    }

    #[test]
    fn sequence_increments_monotonically() {
        let slot = FrameSlot::new();
        let caps = test_caps();
        slot.replace(bytes::Bytes::from_static(b"a"), caps);
        slot.replace(bytes::Bytes::from_static(b"b"), caps);
        let snap = slot.snapshot();
        assert_eq!(snap.frame.unwrap().ingest_seq, 2);
    }

    #[test]
    fn fallback_frame_is_neutral_gray_and_right_size() {
        let caps = test_caps();
        let fallback = FallbackFrame::new(caps);
        let frame = fallback.copy();
        assert_eq!(frame.data.len(), caps.frame_size());
        assert!(frame.data.iter().all(|&b| b == 128));
        assert_eq!(frame.ingest_seq, 0);
    }

    #[test]
    fn caps_frame_size_matches_i420_layout() {
        let caps = Caps::new(PixelFormat::I420, 640, 480, 25);
        // 640*480 + 2*(320*240) = 307200 + 153600 = 460800
        assert_eq!(caps.frame_size(), 460_800);
    }
}
