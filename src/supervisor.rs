//! Supervisor / Signaling (§4.F): the `Init -> Ready -> Running ->
//! Stopping -> Terminated` state machine, the line-delimited JSON stdio
//! control protocol, the stats reporter, and signal handling. Owns
//! construction and teardown of one session's worth of `IngestPath` +
//! `FrameSlot` + `RenderLoop` + `OutputSession` + `KlvDemultiplexer`.
use crate::config::Config;
use crate::error::AppError;
use crate::frame::{Caps, FallbackFrame, FrameSlot, PixelFormat};
use crate::ingest::udp_source::UdpSource;
use crate::ingest::IngestPath;
use crate::klv::KlvDemultiplexer;
use crate::output::OutputSession;
use crate::render::RenderLoop;
use parking_lot::Mutex as PLMutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// §4.F request records, read one-per-line from stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Offer { sdp: String },
    Answer { sdp: String },
    #[serde(rename_all = "camelCase")]
    Ice {
        candidate: String,
        sdp_m_line_index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
    },
}

/// §4.F emitted records, one JSON object per line on stdout.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Ready,
    Stats {
        frames_in: u64,
        frames_out: u64,
        frames_repeated: u64,
    },
    Error {
        message: String,
    },
    Eos,
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Ice {
        candidate: String,
        sdp_m_line_index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
    },
}

/// The §4.F state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Running,
    Stopping,
    Terminated,
}

/// Why a session is ending, distinct from `AppError`: a clean `stop`
/// command and an operator signal are not errors, but both drive the
/// same `Running -> Stopping` transition as a fatal bus error does.
#[derive(Debug)]
pub enum ShutdownReason {
    StopCommand,
    Signal,
    SecondSignal,
    Fatal(AppError),
}

/// One session's worth of running components: everything the Supervisor
/// constructs on `start` and tears down (in reverse) on `stop`.
struct Session {
    ingest: Arc<IngestPath>,
    ingest_task: tokio::task::JoinHandle<()>,
    render: Option<RenderLoop>,
    output: Arc<OutputSession>,
    klv: Arc<PLMutex<KlvDemultiplexer>>,
    frame_slot: Arc<FrameSlot>,
}

impl Session {
    /// Construct B (Frame Slot + Fallback Frame), E (KLV Demultiplexer),
    /// D (Output Path; built before C since the render loop's clock is
    /// the output pipeline's own clock per §E7), C (Render Loop), then A
    /// (Ingest Path, started last so the Frame Slot already has a reader
    /// ready to receive its writes).
    fn start(config: &Config) -> Result<Self, AppError> {
        config.validate()?;

        let caps = Caps::new(PixelFormat::I420, config.width, config.height, config.fps);
        let frame_slot = Arc::new(FrameSlot::new());
        let fallback = Arc::new(FallbackFrame::new(caps));

        let klv = Arc::new(PLMutex::new(KlvDemultiplexer::new(64)));

        let output = Arc::new(OutputSession::new(config, caps)?);
        let render = RenderLoop::spawn(config.fps, frame_slot.clone(), fallback, output.clone())?;

        let ingest = Arc::new(IngestPath::new(config, frame_slot.clone())?);
        let udp = UdpSource::bind(config.input_port, config.udp_buffer)?;

        let ingest_run = ingest.clone();
        let run_config = config.clone();
        let run_klv = klv.clone();
        let ingest_task = tokio::spawn(async move {
            ingest_run.run(run_config, udp, run_klv).await;
        });

        Ok(Self {
            ingest,
            ingest_task,
            render: Some(render),
            output,
            klv,
            frame_slot,
        })
    }

    fn stats(&self) -> (u64, u64, u64) {
        let frames_in = self.ingest.frames_in();
        let render_stats = self
            .render
            .as_ref()
            .map(|r| r.stats())
            .unwrap_or_default();
        (frames_in, render_stats.frames_out, render_stats.frames_repeated)
    }

    fn output_has_failed(&self) -> bool {
        self.output.has_failed()
    }

    /// Reverse-order teardown: stop ingest first (no more writes into the
    /// Frame Slot), join the render loop (it must drain before the
    /// output pipeline is torn down, per §7's render-flow policy), then
    /// let Output/KLV/FrameSlot drop.
    async fn stop(mut self) {
        self.ingest.stop();
        self.ingest_task.abort();
        let _ = self.ingest_task.await;

        if let Some(render) = self.render.take() {
            if let Err(e) = render.stop() {
                warn!(error = %e, "render loop did not stop cleanly");
            }
        }

        // The ingest task has joined, so no more packets reach the demux;
        // flush the last open PES slot per PID before it's dropped.
        self.klv.lock().flush();

        drop(self.output);
        drop(self.klv);
        drop(self.frame_slot);
    }
}

/// Drives the §4.F protocol end to end: owns the state machine, the
/// current `Session` (if any), and the stdio/stats/signal tasks.
pub struct Supervisor {
    config: Config,
    state: State,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: State::Init,
        }
    }

    /// Run until a `stop`/signal/fatal-error transitions all the way to
    /// `Terminated`. Returns the process exit code (§6): always `0` once
    /// construction has succeeded, since `config`/`bind` failures are
    /// surfaced before this point by the caller.
    pub async fn run(mut self) -> i32 {
        self.state = State::Ready;
        emit(Event::Ready).await;
        info!("supervisor ready");

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let stdin_events = event_tx.clone();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut session: Option<Session> = None;
        let mut stats_interval = tokio::time::interval(Duration::from_secs(
            self.config.stats_interval.max(1),
        ));
        stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let stats_enabled = self.config.stats_interval > 0;

        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return 1;
            }
        };
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return 1;
            }
        };
        let mut last_signal: Option<Instant> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break; };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Command>(&line) {
                        Ok(cmd) => {
                            self.handle_command(cmd, &mut session, &stdin_events).await;
                        }
                        Err(e) => {
                            warn!(error = %e, line = %line, "unparseable stdio command, ignoring");
                        }
                    }
                }
                _ = sigint.recv() => {
                    let forced = self.handle_signal(&mut last_signal);
                    let reason = if forced { ShutdownReason::SecondSignal } else { ShutdownReason::Signal };
                    self.shutdown(session, reason).await;
                    return 0;
                }
                _ = sigterm.recv() => {
                    let forced = self.handle_signal(&mut last_signal);
                    let reason = if forced { ShutdownReason::SecondSignal } else { ShutdownReason::Signal };
                    self.shutdown(session, reason).await;
                    return 0;
                }
                _ = stats_interval.tick(), if stats_enabled && session.is_some() => {
                    if let Some(s) = &session {
                        let (frames_in, frames_out, frames_repeated) = s.stats();
                        println!("Stats: in={frames_in} out={frames_out} repeated={frames_repeated}");
                        emit(Event::Stats { frames_in, frames_out, frames_repeated }).await;
                    }
                }
                Some(event) = event_rx.recv() => {
                    emit(event).await;
                }
                else => break,
            }

            if self.state == State::Running {
                if let Some(s) = &session {
                    if s.output_has_failed() {
                        self.shutdown(session.take(), ShutdownReason::Fatal(AppError::OutputFatal(
                            "output pipeline reported a fatal bus error".into(),
                        ))).await;
                        return 0;
                    }
                }
            }

            if self.state == State::Terminated {
                break;
            }
        }

        0
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        session: &mut Option<Session>,
        passthrough: &mpsc::UnboundedSender<Event>,
    ) {
        match cmd {
            Command::Start => {
                if self.state != State::Ready {
                    warn!(state = ?self.state, "ignoring start command outside Ready state");
                    return;
                }
                match Session::start(&self.config) {
                    Ok(s) => {
                        *session = Some(s);
                        self.state = State::Running;
                        info!("session started");
                    }
                    Err(e) => {
                        error!(error = %e, "failed to start session");
                        emit(Event::Error { message: e.to_string() }).await;
                    }
                }
            }
            Command::Stop => {
                if let Some(s) = session.take() {
                    self.state = State::Stopping;
                    s.stop().await;
                    self.state = State::Terminated;
                    emit(Event::Eos).await;
                    info!("session stopped by command");
                }
            }
            // Pass-throughs (§4.F): this core never negotiates SDP itself,
            // it only relays these records unchanged toward the external
            // WebRTC egress component.
            Command::Offer { sdp } => {
                let _ = passthrough.send(Event::Offer { sdp });
            }
            Command::Answer { sdp } => {
                let _ = passthrough.send(Event::Answer { sdp });
            }
            Command::Ice {
                candidate,
                sdp_m_line_index,
                sdp_mid,
            } => {
                let _ = passthrough.send(Event::Ice {
                    candidate,
                    sdp_m_line_index,
                    sdp_mid,
                });
            }
        }
    }

    /// Returns `true` once a *second* signal has arrived within 5s of the
    /// first, meaning the caller should force `Terminated` immediately
    /// rather than waiting for a graceful drain.
    fn handle_signal(&mut self, last_signal: &mut Option<Instant>) -> bool {
        let now = Instant::now();
        let forced = match last_signal {
            Some(t) if now.duration_since(*t) < Duration::from_secs(5) => true,
            _ => false,
        };
        *last_signal = Some(now);

        if forced {
            warn!("second signal within 5s, forcing termination");
            true
        } else {
            info!("signal received, beginning graceful shutdown");
            if self.state == State::Running {
                self.state = State::Stopping;
            }
            false
        }
    }

    async fn shutdown(&mut self, session: Option<Session>, reason: ShutdownReason) {
        match &reason {
            ShutdownReason::Fatal(e) => {
                error!(error = %e, "fatal error, terminating session");
                emit(Event::Error { message: e.to_string() }).await;
            }
            ShutdownReason::SecondSignal => {
                warn!("forced termination on second signal");
            }
            ShutdownReason::Signal | ShutdownReason::StopCommand => {}
        }

        if let Some(s) = session {
            self.state = State::Stopping;
            // Bound the drain per §5: force through after 2s even if a
            // pipeline is slow to reach NULL.
            let _ = tokio::time::timeout(Duration::from_secs(2), s.stop()).await;
        }

        self.state = State::Terminated;
        emit(Event::Eos).await;
        info!("supervisor terminated");
    }
}

async fn emit(event: Event) {
    let Ok(line) = serde_json::to_string(&event) else {
        return;
    };
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(line.as_bytes()).await;
    let _ = stdout.write_all(b"\n").await;
    let _ = stdout.flush().await;
}
