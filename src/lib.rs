//! Clock-driven MPEG-TS frame synchronizer and KLV demultiplexer.
//!
//! The core of this crate is the Render Loop (`render`), which emits a
//! fixed-framerate output stream driven by a monotonic pipeline clock,
//! completely decoupled from the arrival timing of the UDP MPEG-TS input
//! handled by `ingest`. The KLV Demultiplexer (`klv`) reassembles STANAG
//! 4609 metadata from the same transport stream on an independent path.
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod klv;
pub mod output;
pub mod raii_guards;
pub mod render;
pub mod supervisor;
