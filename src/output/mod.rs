//! Output Path: encodes (or passes through) the rendered frame stream and
//! packages it into the configured container. Owns a single immutable
//! `OutputSession` for the lifetime of the pipeline session; any change
//! to codec/container/bitrate/keyframe/sink requires a full rebuild.
pub mod encoder;
pub mod sink;

use crate::config::Config;
use crate::error::AppError;
use crate::frame::Caps;
use crate::raii_guards::PipelineGuard;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::MessageView;
use gstreamer_app as gst_app;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// The active output pipeline: a fixed-caps `appsrc` feeding an encoder
/// (or nothing, for `raw`) and a container tail. Caps never renegotiate
/// mid-session; a fatal bus error latches `failed` for the Supervisor to
/// observe and end the session.
pub struct OutputSession {
    _guard: PipelineGuard,
    appsrc: gst_app::AppSrc,
    _bus_watch: gst::bus::BusWatchGuard,
    failed: Arc<AtomicBool>,
}

impl OutputSession {
    pub fn new(config: &Config, caps: Caps) -> Result<Self, AppError> {
        let pipeline = gst::Pipeline::new();

        let gst_caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", caps.width as i32)
            .field("height", caps.height as i32)
            .field("framerate", gst::Fraction::new(caps.fps as i32, 1))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("render_src")
            .caps(&gst_caps)
            .is_live(true)
            .format(gst::Format::Time)
            .do_timestamp(false)
            .build();

        pipeline
            .add(appsrc.upcast_ref::<gst::Element>())
            .map_err(|e| AppError::OutputFatal(e.to_string()))?;

        let encoder = encoder::create_encoder(config)?;

        let tail_upstream: gst::Element = match &encoder {
            Some(enc) => {
                pipeline
                    .add(enc)
                    .map_err(|e| AppError::OutputFatal(e.to_string()))?;
                appsrc
                    .upcast_ref::<gst::Element>()
                    .link(enc)
                    .map_err(|e| AppError::OutputFatal(e.to_string()))?;
                enc.clone()
            }
            None => appsrc.upcast_ref::<gst::Element>().clone(),
        };

        sink::build_output_tail(&pipeline, &tail_upstream, config)?;

        let failed = Arc::new(AtomicBool::new(false));
        let bus_watch = setup_bus_watch(&pipeline, failed.clone())?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AppError::OutputFatal(e.to_string()))?;

        info!(codec = %config.codec, container = %config.container, "output session started");

        Ok(Self {
            _guard: PipelineGuard::new(pipeline, "output".into()),
            appsrc,
            _bus_watch: bus_watch,
            failed,
        })
    }

    /// The output pipeline's own clock, the Render Loop's scheduling
    /// source (E7): the same clock that timestamps the buffers it waits
    /// on, so there is no drift between decision time and clock time.
    pub fn clock(&self) -> Option<gst::Clock> {
        self._guard.pipeline().clock()
    }

    pub fn base_time(&self) -> Option<gst::ClockTime> {
        self._guard.pipeline().base_time()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Push one stamped frame. `render-flow` errors (flushing/EOS) are
    /// returned to the caller, which must exit its loop; transient flow
    /// errors are logged and treated as a no-op continue.
    pub fn push(
        &self,
        data: bytes::Bytes,
        pts: gst::ClockTime,
        duration: gst::ClockTime,
    ) -> Result<(), AppError> {
        let mut buffer = gst::Buffer::from_slice(data);
        {
            let buffer_ref = buffer.get_mut().expect("freshly created buffer is unshared");
            buffer_ref.set_pts(pts);
            buffer_ref.set_dts(pts);
            buffer_ref.set_duration(duration);
        }

        match self.appsrc.push_buffer(buffer) {
            Ok(_) => Ok(()),
            Err(gst::FlowError::Flushing) | Err(gst::FlowError::Eos) => {
                Err(AppError::RenderFlow("output source is flushing or at EOS".into()))
            }
            Err(e) => {
                warn!(error = %e, "transient push-buffer error, continuing");
                Ok(())
            }
        }
    }
}

fn setup_bus_watch(
    pipeline: &gst::Pipeline,
    failed: Arc<AtomicBool>,
) -> Result<gst::bus::BusWatchGuard, AppError> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| AppError::OutputFatal("pipeline has no bus".into()))?;

    bus.add_watch(move |_bus, msg| {
        match msg.view() {
            MessageView::Error(err) => {
                let src = err.src().map(|s| s.path_string()).unwrap_or_default();
                error!(%src, error = %err.error(), debug = ?err.debug(), "output pipeline error");
                failed.store(true, Ordering::Relaxed);
            }
            MessageView::Warning(w) => {
                let src = w.src().map(|s| s.path_string()).unwrap_or_default();
                warn!(%src, error = %w.error(), "output pipeline warning");
            }
            MessageView::Eos(_) => {
                warn!("output pipeline reached EOS");
            }
            _ => {}
        }
        gst::glib::ControlFlow::Continue
    })
    .map_err(|e| AppError::OutputFatal(e.to_string()))
}
