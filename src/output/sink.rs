//! Container tail construction for the Output Path: payloader/muxer/sink
//! chains for each {codec, container} combination named in the external
//! interfaces table.
use crate::config::{Codec, Config, Container};
use crate::error::AppError;
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::info;

fn make(factory: &str) -> Result<gst::Element, AppError> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| AppError::OutputFatal(format!("failed to create {factory}: {e}")))
}

fn rtp_payloader(codec: Codec) -> Result<gst::Element, AppError> {
    let factory = match codec {
        Codec::H264 => "rtph264pay",
        Codec::H265 => "rtph265pay",
        Codec::Vp8 => "rtpvp8pay",
        Codec::Vp9 => "rtpvp9pay",
        Codec::Raw => "rtpvrawpay",
    };
    let pay = make(factory)?;
    pay.set_property("pt", &96u32);
    Ok(pay)
}

fn file_muxer_factory(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 | Codec::H265 => "mp4mux",
        Codec::Vp8 | Codec::Vp9 => "matroskamux",
        Codec::Raw => "avimux",
    }
}

fn file_muxer(codec: Codec) -> Result<gst::Element, AppError> {
    make(file_muxer_factory(codec))
}

/// Build and link the container tail onto the pipeline, starting from
/// `upstream` (the last element of the encode stage, or the appsrc
/// itself for `raw`). Elements are added to `pipeline` and linked in
/// place; nothing is returned because nothing downstream of the tail
/// needs to be referenced again.
pub fn build_output_tail(
    pipeline: &gst::Pipeline,
    upstream: &gst::Element,
    config: &Config,
) -> Result<(), AppError> {
    match config.container {
        Container::Rtp => {
            let pay = rtp_payloader(config.codec)?;
            let sink = make("udpsink")?;
            sink.set_property("host", &config.host);
            sink.set_property("port", &(config.output_port as i32));
            sink.set_property("sync", &false);

            pipeline
                .add_many([&pay, &sink])
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;
            gst::Element::link_many([upstream, &pay, &sink])
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;

            info!(host = %config.host, port = config.output_port, "configured rtp output");
        }
        Container::Mpegts => {
            let mux = make("mpegtsmux")?;
            let sink = make("udpsink")?;
            sink.set_property("host", &config.host);
            sink.set_property("port", &(config.output_port as i32));
            sink.set_property("sync", &false);

            pipeline
                .add_many([&mux, &sink])
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;
            gst::Element::link_many([upstream, &mux, &sink])
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;

            info!(host = %config.host, port = config.output_port, "configured mpegts output");
        }
        Container::Shm => {
            let shm_path = config
                .shm_path
                .as_ref()
                .ok_or_else(|| AppError::Config("container=shm requires shm-path".into()))?;
            let sink = make("shmsink")?;
            sink.set_property("socket-path", shm_path);
            sink.set_property("shm-size", &(config.shm_size as u64));
            sink.set_property("sync", &false);
            sink.set_property("wait-for-connection", &false);

            pipeline
                .add(&sink)
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;
            upstream
                .link(&sink)
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;

            info!(shm_path, size = config.shm_size, "configured shm output");
        }
        Container::Raw => {
            let sink = make("udpsink")?;
            sink.set_property("host", &config.host);
            sink.set_property("port", &(config.output_port as i32));
            sink.set_property("sync", &false);

            pipeline
                .add(&sink)
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;
            upstream
                .link(&sink)
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;

            info!(host = %config.host, port = config.output_port, "configured raw elementary stream output");
        }
        Container::File => {
            let mux = file_muxer(config.codec)?;
            let sink = make("filesink")?;
            let path = config.output_file_path();
            sink.set_property("location", &path.to_string_lossy().to_string());

            pipeline
                .add_many([&mux, &sink])
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;
            gst::Element::link_many([upstream, &mux, &sink])
                .map_err(|e| AppError::OutputFatal(e.to_string()))?;

            info!(path = %path.display(), "configured file output");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_muxer_choice_matches_codec() {
        // Pure mapping logic, independent of GStreamer init. Exercises the
        // same `file_muxer_factory` that `file_muxer` itself calls, so this
        // can't drift from the element actually wired into the pipeline.
        assert_eq!(file_muxer_factory(Codec::H264), "mp4mux");
        assert_eq!(file_muxer_factory(Codec::H265), "mp4mux");
        assert_eq!(file_muxer_factory(Codec::Vp8), "matroskamux");
        assert_eq!(file_muxer_factory(Codec::Vp9), "matroskamux");
        assert_eq!(file_muxer_factory(Codec::Raw), "avimux");
    }
}
