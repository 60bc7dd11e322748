//! Per-codec GStreamer encoder construction for the Output Path. Every
//! preset targets low-latency realtime encoding with a configurable
//! bitrate and max keyframe distance; `raw` skips encoding entirely.
use crate::config::{Codec, Config};
use crate::error::AppError;
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::info;

/// Build the encoder element for the configured codec, or `None` for
/// `raw` (passthrough, no encode stage in the pipeline).
pub fn create_encoder(config: &Config) -> Result<Option<gst::Element>, AppError> {
    match config.codec {
        Codec::Raw => Ok(None),
        Codec::H264 => Ok(Some(create_h264_encoder(config)?)),
        Codec::H265 => Ok(Some(create_h265_encoder(config)?)),
        Codec::Vp8 => Ok(Some(create_vp8_encoder(config)?)),
        Codec::Vp9 => Ok(Some(create_vp9_encoder(config)?)),
    }
}

fn make(factory: &str) -> Result<gst::Element, AppError> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| AppError::OutputFatal(format!("failed to create {factory}: {e}")))
}

fn create_h264_encoder(config: &Config) -> Result<gst::Element, AppError> {
    let encoder = make("x264enc")?;

    encoder.set_property_from_str("speed-preset", "ultrafast");
    encoder.set_property_from_str("tune", "zerolatency");
    encoder.set_property("cabac", &false);
    encoder.set_property("dct8x8", &false);
    encoder.set_property("bframes", &0u32);
    encoder.set_property("byte-stream", &true);
    encoder.set_property("key-int-max", &config.keyframe);
    encoder.set_property("bitrate", &config.bitrate);
    encoder.set_property_from_str("pass", "cbr");
    encoder.set_property("ref", &1u32);
    encoder.set_property("rc-lookahead", &0i32);
    encoder.set_property("sync-lookahead", &0i32);

    info!(bitrate = config.bitrate, keyframe = config.keyframe, "configured h264 encoder");
    Ok(encoder)
}

fn create_h265_encoder(config: &Config) -> Result<gst::Element, AppError> {
    let encoder = make("x265enc")?;

    encoder.set_property_from_str("speed-preset", "ultrafast");
    encoder.set_property_from_str("tune", "zerolatency");
    encoder.set_property("key-int-max", &config.keyframe);
    encoder.set_property("bitrate", &config.bitrate);

    info!(bitrate = config.bitrate, keyframe = config.keyframe, "configured h265 encoder");
    Ok(encoder)
}

fn create_vp8_encoder(config: &Config) -> Result<gst::Element, AppError> {
    let encoder = make("vp8enc")?;

    encoder.set_property("deadline", &1i64); // VPX_DL_REALTIME
    encoder.set_property("cpu-used", &-5i32);
    encoder.set_property("target-bitrate", &(config.bitrate as i32 * 1000));
    encoder.set_property("keyframe-max-dist", &(config.keyframe as i32));
    encoder.set_property("threads", &2i32);
    encoder.set_property("lag-in-frames", &0i32);

    info!(bitrate = config.bitrate, keyframe = config.keyframe, "configured vp8 encoder");
    Ok(encoder)
}

fn create_vp9_encoder(config: &Config) -> Result<gst::Element, AppError> {
    let encoder = make("vp9enc")?;

    encoder.set_property("deadline", &1i64);
    encoder.set_property("cpu-used", &-5i32);
    encoder.set_property("target-bitrate", &(config.bitrate as i32 * 1000));
    encoder.set_property("keyframe-max-dist", &(config.keyframe as i32));
    encoder.set_property("lag-in-frames", &0i32);

    info!(bitrate = config.bitrate, keyframe = config.keyframe, "configured vp9 encoder");
    Ok(encoder)
}
