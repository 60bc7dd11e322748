//! Error taxonomy for the synchronizer session.
//!
//! `config` and `bind` are the only fatal-at-startup classes; everything
//! else ends the current session (an `error` stdio record, transition to
//! `Stopping`/`Terminated`) without killing the process, per the error
//! handling policy: supervised restart is an external responsibility.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("ingest transient error: {0}")]
    IngestTransient(String),

    #[error("ingest structural error: {0}")]
    IngestStructural(String),

    #[error("render flow error: {0}")]
    RenderFlow(String),

    #[error("output fatal error: {0}")]
    OutputFatal(String),

    #[error("gstreamer error: {0}")]
    Gst(String),
}

impl AppError {
    /// True for the two classes that are fatal at process startup (exit
    /// code 1); every other variant only ever terminates the session.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::Bind(_))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_fatal_at_startup() {
            1
        } else {
            0
        }
    }
}

impl From<gstreamer::glib::Error> for AppError {
    fn from(e: gstreamer::glib::Error) -> Self {
        AppError::Gst(e.to_string())
    }
}

impl From<gstreamer::StateChangeError> for AppError {
    fn from(e: gstreamer::StateChangeError) -> Self {
        AppError::Gst(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_bind_are_fatal_at_startup() {
        assert!(AppError::Config("bad".into()).is_fatal_at_startup());
        assert!(AppError::Bind(std::io::Error::new(std::io::ErrorKind::AddrInUse, "x"))
            .is_fatal_at_startup());
    }

    #[test]
    fn session_errors_are_not_fatal_at_startup() {
        assert!(!AppError::IngestTransient("x".into()).is_fatal_at_startup());
        assert!(!AppError::IngestStructural("x".into()).is_fatal_at_startup());
        assert!(!AppError::RenderFlow("x".into()).is_fatal_at_startup());
        assert!(!AppError::OutputFatal("x".into()).is_fatal_at_startup());
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(AppError::Config("x".into()).exit_code(), 1);
        assert_eq!(AppError::OutputFatal("x".into()).exit_code(), 0);
    }
}
