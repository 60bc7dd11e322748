//! Process entry point: CLI/config assembly, GStreamer and tracing
//! initialization, and handing off to the Supervisor for the lifetime of
//! the process. Exit codes follow §6: `0` normal, `1` on configuration or
//! pipeline construction failure.
use clap::Parser;
use gstreamer as gst;
use sync_core::config::CliArgs;
use sync_core::supervisor::Supervisor;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args = CliArgs::parse();

    let config = match args.resolve() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration validation failed");
        std::process::exit(e.exit_code());
    }

    if let Err(e) = gst::init() {
        error!(error = %e, "failed to initialize GStreamer");
        std::process::exit(1);
    }

    let supervisor = Supervisor::new(config);
    let exit_code = supervisor.run().await;
    std::process::exit(exit_code);
}
