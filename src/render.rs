//! Render Loop: the dedicated, clock-driven thread that emits exactly
//! `fps` frames per wall-clock second into the Output Path, independent
//! of how (or whether) the Ingest Path is currently delivering frames.
//!
//! Scheduling is tied to the output pipeline's own `gst::Clock` (§E7):
//! `target := base_time + n * frame_duration`, waited on via
//! `clock.new_single_shot_id(target).wait()` rather than `thread::sleep`,
//! so cumulative drift is zero over arbitrarily long runs.
use crate::error::AppError;
use crate::frame::{FallbackFrame, FrameSlot};
use crate::output::OutputSession;
use gstreamer as gst;
use gstreamer::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Snapshot of the counters §4.C step 6/7 requires, read by the stats
/// reporter on whatever cadence `stats-interval` dictates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderStats {
    pub frames_out: u64,
    pub frames_repeated: u64,
}

/// One tick's decision: which bytes to push and whether this tick is a
/// repeat (stale slot, or the same ingest frame as last tick). Pure and
/// free of any clock/GStreamer dependency so the decision logic is
/// testable without a pipeline.
struct TickDecision {
    data: bytes::Bytes,
    is_repeat: bool,
    new_last_pushed_seq: u64,
}

fn decide_tick(
    snap_frame: Option<(bytes::Bytes, u64)>,
    snap_is_stale: bool,
    fallback: &FallbackFrame,
    last_pushed_seq: u64,
) -> TickDecision {
    match snap_frame {
        Some((data, seq)) if !snap_is_stale => {
            let is_repeat = seq == last_pushed_seq;
            TickDecision {
                data,
                is_repeat,
                new_last_pushed_seq: seq,
            }
        }
        _ => TickDecision {
            data: fallback.copy().data,
            is_repeat: true,
            new_last_pushed_seq: 0,
        },
    }
}

/// §4.C's wall-clock-driven render loop, running on its own OS thread.
pub struct RenderLoop {
    running: Arc<AtomicBool>,
    frames_out: Arc<AtomicU64>,
    frames_repeated: Arc<AtomicU64>,
    handle: Option<JoinHandle<Result<(), AppError>>>,
}

impl RenderLoop {
    /// Spawn the render thread. `fps` and the fallback frame's caps must
    /// already match the output session's fixed caps (§4.D: caps never
    /// renegotiate mid-session).
    pub fn spawn(
        fps: u32,
        frame_slot: Arc<FrameSlot>,
        fallback: Arc<FallbackFrame>,
        output: Arc<OutputSession>,
    ) -> Result<Self, AppError> {
        let running = Arc::new(AtomicBool::new(true));
        let frames_out = Arc::new(AtomicU64::new(0));
        let frames_repeated = Arc::new(AtomicU64::new(0));

        let thread_running = running.clone();
        let thread_frames_out = frames_out.clone();
        let thread_frames_repeated = frames_repeated.clone();

        let clock = output
            .clock()
            .ok_or_else(|| AppError::OutputFatal("output pipeline has no clock".into()))?;
        let base_time = output
            .base_time()
            .unwrap_or_else(|| clock.time().unwrap_or(gst::ClockTime::ZERO));

        let frame_duration_ns = 1_000_000_000u64 / fps as u64;
        let frame_duration = gst::ClockTime::from_nseconds(frame_duration_ns);

        let handle = std::thread::Builder::new()
            .name("render-loop".into())
            .spawn(move || {
                run_loop(
                    clock,
                    base_time,
                    frame_duration,
                    frame_slot,
                    fallback,
                    output,
                    thread_running,
                    thread_frames_out,
                    thread_frames_repeated,
                )
            })
            .map_err(|e| AppError::RenderFlow(format!("failed to spawn render thread: {e}")))?;

        Ok(Self {
            running,
            frames_out,
            frames_repeated,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> RenderStats {
        RenderStats {
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_repeated: self.frames_repeated.load(Ordering::Relaxed),
        }
    }

    /// Clear the cancellation flag and join the thread. The loop notices
    /// `running == false` at the next tick boundary, never mid-push.
    pub fn stop(mut self) -> Result<(), AppError> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(result) => result,
                Err(_) => Err(AppError::RenderFlow("render thread panicked".into())),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    clock: gst::Clock,
    base_time: gst::ClockTime,
    frame_duration: gst::ClockTime,
    frame_slot: Arc<FrameSlot>,
    fallback: Arc<FallbackFrame>,
    output: Arc<OutputSession>,
    running: Arc<AtomicBool>,
    frames_out: Arc<AtomicU64>,
    frames_repeated: Arc<AtomicU64>,
) -> Result<(), AppError> {
    let base_time_ns = base_time.nseconds();
    let frame_duration_ns = frame_duration.nseconds();
    let mut last_pushed_seq: u64 = 0;
    let mut was_stale_latch = false;
    let mut n: u64 = 0;

    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let target = gst::ClockTime::from_nseconds(base_time_ns + frame_duration_ns * n);
        wait_until(&clock, target);

        if !running.load(Ordering::Relaxed) {
            break;
        }

        let snap = frame_slot.snapshot();
        if snap.is_stale {
            if !was_stale_latch {
                warn!("no signal: render loop is emitting fallback frames");
                was_stale_latch = true;
            }
        } else if was_stale_latch {
            info!("signal restored: render loop resuming live frames");
            was_stale_latch = false;
        }

        let decision = decide_tick(
            snap.frame.map(|f| (f.data, f.ingest_seq)),
            snap.is_stale,
            &fallback,
            last_pushed_seq,
        );
        last_pushed_seq = decision.new_last_pushed_seq;

        let pts = gst::ClockTime::from_nseconds(frame_duration_ns * n);
        match output.push(decision.data, pts, frame_duration) {
            Ok(()) => {}
            Err(AppError::RenderFlow(msg)) => {
                warn!(reason = %msg, "render loop exiting: output source is flushing or at EOS");
                return Err(AppError::RenderFlow(msg));
            }
            Err(e) => {
                warn!(error = %e, "transient render-flow error, continuing");
            }
        }

        frames_out.fetch_add(1, Ordering::Relaxed);
        if decision.is_repeat {
            frames_repeated.fetch_add(1, Ordering::Relaxed);
        }

        if output.has_failed() {
            return Err(AppError::OutputFatal(
                "output pipeline reported a fatal bus error".into(),
            ));
        }

        n += 1;
    }

    Ok(())
}

/// Block on the pipeline clock until `target`. Falls back to a short
/// real-time sleep if the clock can't produce a wait ID (defensive; not
/// expected in normal operation with a live pipeline clock).
fn wait_until(clock: &gst::Clock, target: gst::ClockTime) {
    match clock.new_single_shot_id(target) {
        Some(id) => {
            let _ = id.wait();
        }
        None => {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Caps, PixelFormat};

    fn caps() -> Caps {
        Caps::new(PixelFormat::I420, 64, 48, 25)
    }

    #[test]
    fn fresh_frame_is_pushed_and_not_a_repeat() {
        let fallback = FallbackFrame::new(caps());
        let decision = decide_tick(
            Some((bytes::Bytes::from_static(b"live"), 7)),
            false,
            &fallback,
            6,
        );
        assert_eq!(&decision.data[..], b"live");
        assert!(!decision.is_repeat);
        assert_eq!(decision.new_last_pushed_seq, 7);
    }

    #[test]
    fn same_sequence_as_last_tick_is_a_repeat() {
        let fallback = FallbackFrame::new(caps());
        let decision = decide_tick(
            Some((bytes::Bytes::from_static(b"live"), 7)),
            false,
            &fallback,
            7,
        );
        assert!(decision.is_repeat);
    }

    #[test]
    fn stale_snapshot_falls_back_regardless_of_frame_presence() {
        let fallback = FallbackFrame::new(caps());
        let decision = decide_tick(Some((bytes::Bytes::from_static(b"live"), 9)), true, &fallback, 3);
        assert_eq!(decision.data, fallback.copy().data);
        assert!(decision.is_repeat);
        assert_eq!(decision.new_last_pushed_seq, 0);
    }

    #[test]
    fn no_frame_at_all_falls_back() {
        let fallback = FallbackFrame::new(caps());
        let decision = decide_tick(None, false, &fallback, 0);
        assert_eq!(decision.data, fallback.copy().data);
        assert!(decision.is_repeat);
    }

    #[test]
    fn tick_stride_is_exact_frame_duration() {
        let frame_duration_ns = 1_000_000_000u64 / 25;
        let base_ns = 0u64;
        let t0 = gst::ClockTime::from_nseconds(base_ns + frame_duration_ns * 0);
        let t1 = gst::ClockTime::from_nseconds(base_ns + frame_duration_ns * 1);
        assert_eq!((t1 - t0), gst::ClockTime::from_nseconds(frame_duration_ns));
    }
}
