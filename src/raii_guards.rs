//! RAII guard for GStreamer pipeline teardown.
//!
//! When the guard is dropped, the pipeline is stopped and flushed, even in
//! panic scenarios. Used by the ingest and output pipelines so a session
//! never leaks a pipeline in a non-NULL state across rebuilds.
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{debug, info, warn};

/// RAII guard for a complete GStreamer pipeline. Ensures the pipeline is
/// stopped and flushed when dropped.
pub struct PipelineGuard {
    pipeline: gst::Pipeline,
    name: String,
}

impl PipelineGuard {
    pub fn new(pipeline: gst::Pipeline, name: String) -> Self {
        info!(%name, "created RAII guard for pipeline");
        Self { pipeline, name }
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        info!(name = %self.name, "dropping PipelineGuard");

        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(name = %self.name, error = %e, "failed to stop pipeline");
        }

        let _ = self.pipeline.send_event(gst::event::FlushStart::new());
        let _ = self
            .pipeline
            .send_event(gst::event::FlushStop::builder(true).build());

        debug!(name = %self.name, "pipeline stopped and flushed");
    }
}
