//! Ingest Path: UDP MPEG-TS reception, jitter absorption, TS demux,
//! decode, pixel normalization, and delivery into the Frame Slot. Runs a
//! parallel KLV branch that bypasses the jitter queue entirely (the KLV
//! demultiplexer doesn't need real-time pacing, only per-packet framing).
pub mod jitter_queue;
pub mod udp_source;

use crate::config::Config;
use crate::error::AppError;
use crate::frame::{Caps, FrameSlot, PixelFormat};
use crate::klv::KlvDemultiplexer;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::MessageView;
use gstreamer_app as gst_app;
use jitter_queue::JitterQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use udp_source::{TsPacketizer, UdpSource};

/// The currently attached decode branch: decodebin -> videoconvert ->
/// videoscale -> capsfilter -> appsink, linked to one of tsdemux's source
/// pads. Torn down and rebuilt on source hot-swap (§4.A) without touching
/// the upstream tsdemux or the downstream Frame Slot.
struct DecodeBranch {
    elements: Vec<gst::Element>,
    pipeline: gst::Pipeline,
}

impl Drop for DecodeBranch {
    fn drop(&mut self) {
        for el in &self.elements {
            let _ = el.set_state(gst::State::Null);
            let _ = self.pipeline.remove(el);
        }
    }
}

pub struct IngestPath {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    running: Arc<AtomicBool>,
    frames_in: Arc<AtomicU64>,
    _bus_watch: gst::bus::BusWatchGuard,
    current_branch: Arc<Mutex<Option<DecodeBranch>>>,
}

impl IngestPath {
    /// Build the decode pipeline (appsrc -> tsdemux -> dynamic branch)
    /// and wire its video output into `frame_slot`.
    pub fn new(config: &Config, frame_slot: Arc<FrameSlot>) -> Result<Self, AppError> {
        let pipeline = gst::Pipeline::new();

        let appsrc = gst_app::AppSrc::builder()
            .name("ts_src")
            .format(gst::Format::Bytes)
            .is_live(true)
            .do_timestamp(true)
            .build();

        let tsdemux = gst::ElementFactory::make("tsdemux")
            .build()
            .map_err(|e| AppError::IngestStructural(format!("failed to create tsdemux: {e}")))?;

        pipeline
            .add_many([appsrc.upcast_ref::<gst::Element>(), &tsdemux])
            .map_err(|e| AppError::IngestStructural(e.to_string()))?;
        appsrc
            .upcast_ref::<gst::Element>()
            .link(&tsdemux)
            .map_err(|e| AppError::IngestStructural(e.to_string()))?;

        let current_branch: Arc<Mutex<Option<DecodeBranch>>> = Arc::new(Mutex::new(None));
        let frames_in = Arc::new(AtomicU64::new(0));

        let branch_pipeline = pipeline.clone();
        let branch_slot = frame_slot.clone();
        let branch_caps = Caps::new(PixelFormat::I420, config.width, config.height, config.fps);
        let branch_store = current_branch.clone();
        let branch_counter = frames_in.clone();

        tsdemux.connect_pad_added(move |_tsdemux, pad| {
            let caps = match pad.current_caps() {
                Some(c) => c,
                None => return,
            };
            let structure = match caps.structure(0) {
                Some(s) => s,
                None => return,
            };
            if !structure.name().starts_with("video/") {
                // Non-video elementary streams (audio, private data) are
                // not part of this core's output path; ignore.
                return;
            }

            debug!(pad = %pad.name(), "tsdemux produced a new video pad, attaching decode branch");

            if let Err(e) = attach_decode_branch(
                &branch_pipeline,
                pad,
                branch_caps,
                branch_slot.clone(),
                branch_counter.clone(),
                branch_store.clone(),
            ) {
                error!(error = %e, "failed to attach decode branch on source hot-swap");
            }
        });

        let failed_flag = Arc::new(AtomicBool::new(false));
        let bus_watch = setup_ingest_bus_watch(&pipeline, failed_flag)?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AppError::IngestStructural(e.to_string()))?;

        Ok(Self {
            pipeline,
            appsrc,
            running: Arc::new(AtomicBool::new(true)),
            frames_in,
            _bus_watch: bus_watch,
            current_branch,
        })
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.pipeline.set_state(gst::State::Null);
        self.current_branch.lock().take();
    }

    /// Feed one TS packet into the decode pipeline.
    fn push_ts_packet(&self, packet: Bytes) -> Result<(), AppError> {
        let buffer = gst::Buffer::from_slice(packet);
        match self.appsrc.push_buffer(buffer) {
            Ok(_) => Ok(()),
            Err(e) => Err(AppError::IngestTransient(format!(
                "appsrc push failed: {e}"
            ))),
        }
    }

    /// Drive the UDP receive loop: fan each datagram out to the jitter
    /// queue (video path, paced release) and directly to the KLV branch
    /// (no pacing needed). Runs until `running` is cleared.
    pub async fn run(
        self: Arc<Self>,
        config: Config,
        udp: UdpSource,
        klv: Arc<Mutex<KlvDemultiplexer>>,
    ) {
        let mut jitter = JitterQueue::new(
            Duration::from_millis(config.jitter_buffer_ms),
            Duration::from_millis(config.max_queue_ms),
        );
        let mut video_packetizer = TsPacketizer::new();
        let mut klv_packetizer = TsPacketizer::new();
        let mut buf = vec![0u8; 4096];

        loop {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            let n = match udp.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "ingest transient: udp recv error, continuing");
                    continue;
                }
            };
            if n == 0 {
                continue;
            }
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            // KLV branch: bypasses jitter absorption entirely.
            for packet in klv_packetizer.feed(&datagram) {
                klv.lock().process_packet(&packet);
            }

            // Video branch: jitter queue absorbs arrival-time variance.
            jitter.push(datagram);
            while let Some(chunk) = jitter.try_pop() {
                for packet in video_packetizer.feed(&chunk) {
                    // frames_in is incremented in the appsink callback
                    // (attach_decode_branch), once per decoded frame, not
                    // once per TS packet pushed here.
                    if let Err(e) = self.push_ts_packet(packet) {
                        debug!(error = %e, "ingest-transient: dropping malformed TS packet");
                    }
                }
            }
        }
    }
}

/// Attach a fresh `decodebin` to a tsdemux video pad on source hot-swap.
/// `decodebin` does the automatic codec discovery §4.A.4 asks for (H.264,
/// H.265, MPEG-2, VP8, VP9) and instantiates whatever decoder element the
/// stream needs; its own `pad-added` fires once that decoder produces a
/// raw pad, which is where `attach_raw_sink_chain` picks up.
fn attach_decode_branch(
    pipeline: &gst::Pipeline,
    src_pad: &gst::Pad,
    target_caps: Caps,
    frame_slot: Arc<FrameSlot>,
    frames_in: Arc<AtomicU64>,
    current: Arc<Mutex<Option<DecodeBranch>>>,
) -> Result<(), AppError> {
    // Source hot-swap: block the new pad, tear down any existing branch,
    // build and link the new one, then unblock. The Frame Slot retains
    // its last good frame throughout, so the Render Loop simply repeats
    // it until the new branch's first frame lands.
    let _probe_id = src_pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_pad, _info| {
        gst::PadProbeReturn::Ok
    });

    if let Some(old) = current.lock().take() {
        debug!("tearing down stale decode branch for source hot-swap");
        drop(old);
    }

    let decodebin = gst::ElementFactory::make("decodebin")
        .build()
        .map_err(|e| AppError::IngestStructural(format!("failed to create decodebin: {e}")))?;

    pipeline
        .add(&decodebin)
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;

    let decodebin_sink = decodebin
        .static_pad("sink")
        .ok_or_else(|| AppError::IngestStructural("decodebin has no sink pad".into()))?;
    src_pad
        .link(&decodebin_sink)
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;

    decodebin
        .sync_state_with_parent()
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;

    *current.lock() = Some(DecodeBranch {
        elements: vec![decodebin.clone()],
        pipeline: pipeline.clone(),
    });

    let raw_pipeline = pipeline.clone();
    let raw_slot = frame_slot;
    let raw_counter = frames_in;
    let raw_current = current.clone();
    decodebin.connect_pad_added(move |_decodebin, raw_pad| {
        let caps = match raw_pad.current_caps() {
            Some(c) => c,
            None => return,
        };
        let structure = match caps.structure(0) {
            Some(s) => s,
            None => return,
        };
        if !structure.name().starts_with("video/x-raw") {
            // decodebin may also expose an audio pad; not part of this
            // core's output path.
            return;
        }

        debug!(pad = %raw_pad.name(), "decodebin produced a raw video pad, attaching sink chain");

        if let Err(e) = attach_raw_sink_chain(
            &raw_pipeline,
            raw_pad,
            target_caps,
            raw_slot.clone(),
            raw_counter.clone(),
            raw_current.clone(),
        ) {
            error!(error = %e, "failed to attach decoded-frame sink chain");
        }
    });

    src_pad.remove_probe(_probe_id.expect("probe was just added"));

    info!("decodebin attached, awaiting first raw video pad");
    Ok(())
}

/// Build videoconvert -> videoscale -> capsfilter -> appsink and link it
/// to `decodebin`'s newly produced raw pad, appending those elements onto
/// the in-flight `DecodeBranch` so hot-swap teardown still finds them.
fn attach_raw_sink_chain(
    pipeline: &gst::Pipeline,
    src_pad: &gst::Pad,
    target_caps: Caps,
    frame_slot: Arc<FrameSlot>,
    frames_in: Arc<AtomicU64>,
    current: Arc<Mutex<Option<DecodeBranch>>>,
) -> Result<(), AppError> {
    let videoconvert = gst::ElementFactory::make("videoconvert")
        .build()
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;
    let videoscale = gst::ElementFactory::make("videoscale")
        .build()
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;
    let capsfilter = gst::ElementFactory::make("capsfilter")
        .build()
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;
    let caps = gst::Caps::builder("video/x-raw")
        .field("format", "I420")
        .field("width", target_caps.width as i32)
        .field("height", target_caps.height as i32)
        .field("framerate", gst::Fraction::new(target_caps.fps as i32, 1))
        .build();
    capsfilter.set_property("caps", &caps);

    let appsink = gst_app::AppSink::builder()
        .name("decode_sink")
        .sync(false)
        .build();
    appsink.set_max_buffers(1);
    appsink.set_drop(true);

    let sink_slot = frame_slot;
    let sink_counter = frames_in;
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = match sink.pull_sample() {
                    Ok(s) => s,
                    Err(_) => return Ok(gst::FlowSuccess::Ok),
                };
                let buffer = match sample.buffer() {
                    Some(b) => b,
                    None => return Ok(gst::FlowSuccess::Ok),
                };
                let map = match buffer.map_readable() {
                    Ok(m) => m,
                    Err(_) => return Ok(gst::FlowSuccess::Ok),
                };
                let data = Bytes::copy_from_slice(map.as_slice());
                sink_slot.replace(data, target_caps);
                sink_counter.fetch_add(1, Ordering::Relaxed);
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    let new_elements = vec![
        videoconvert.clone(),
        videoscale.clone(),
        capsfilter.clone(),
        appsink.upcast_ref::<gst::Element>().clone(),
    ];

    pipeline
        .add_many(new_elements.iter().collect::<Vec<_>>())
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;
    gst::Element::link_many([&videoconvert, &videoscale, &capsfilter, appsink.upcast_ref()])
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;

    for el in &new_elements {
        el.sync_state_with_parent()
            .map_err(|e| AppError::IngestStructural(e.to_string()))?;
    }

    let convert_sink_pad = videoconvert
        .static_pad("sink")
        .ok_or_else(|| AppError::IngestStructural("videoconvert has no sink pad".into()))?;
    src_pad
        .link(&convert_sink_pad)
        .map_err(|e| AppError::IngestStructural(e.to_string()))?;

    if let Some(branch) = current.lock().as_mut() {
        branch.elements.extend(new_elements);
    }

    info!("decode branch fully attached (raw video flowing to frame slot)");
    Ok(())
}

fn setup_ingest_bus_watch(
    pipeline: &gst::Pipeline,
    failed: Arc<AtomicBool>,
) -> Result<gst::bus::BusWatchGuard, AppError> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| AppError::IngestStructural("pipeline has no bus".into()))?;

    bus.add_watch(move |_bus, msg| {
        match msg.view() {
            MessageView::Error(err) => {
                let src = err.src().map(|s| s.path_string()).unwrap_or_default();
                error!(%src, error = %err.error(), "ingest pipeline error");
                failed.store(true, Ordering::Relaxed);
            }
            MessageView::Warning(w) => {
                let src = w.src().map(|s| s.path_string()).unwrap_or_default();
                warn!(%src, error = %w.error(), "ingest pipeline warning");
            }
            _ => {}
        }
        gst::glib::ControlFlow::Continue
    })
    .map_err(|e| AppError::IngestStructural(e.to_string()))
}

