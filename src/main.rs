use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use triage_voice::{
    create_router, AppState, AudioOutput, AudioSource, Config, Role, SessionConfig, SessionState,
    VoiceSession,
};

#[derive(Parser)]
#[command(name = "triage-voice", version, about = "Voice client for the medical triage agent")]
struct Cli {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/triage-voice")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one call in the terminal until Ctrl-C or the agent hangs up
    Call {
        /// Agent WebSocket URL
        #[arg(long)]
        endpoint: Option<String>,

        /// Bearer token
        #[arg(long)]
        token: Option<String>,

        /// microphone | silence | file:<path>
        #[arg(long)]
        source: Option<AudioSource>,

        /// speaker | null | wav:<path>
        #[arg(long)]
        output: Option<AudioOutput>,

        /// Write the transcript as JSON when the call ends
        #[arg(long)]
        transcript_out: Option<PathBuf>,
    },

    /// Serve the HTTP control API
    Serve {
        #[arg(long)]
        bind: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Call {
            endpoint,
            token,
            source,
            output,
            transcript_out,
        } => {
            let mut session_config = cfg.session_config();
            if let Some(endpoint) = endpoint {
                session_config.endpoint = endpoint;
            }
            if token.is_some() {
                session_config.auth_token = token;
            }
            if let Some(source) = source {
                session_config.capture.source = source;
            }
            if let Some(output) = output {
                session_config.playback.output = output;
            }
            run_call(session_config, transcript_out).await
        }
        Command::Serve { bind, port } => {
            let bind = bind.unwrap_or_else(|| cfg.service.http.bind.clone());
            let port = port.unwrap_or(cfg.service.http.port);
            serve(cfg.session_config(), &bind, port).await
        }
    }
}

async fn run_call(config: SessionConfig, transcript_out: Option<PathBuf>) -> Result<()> {
    info!(
        "Calling {} (source {}, output {})",
        config.endpoint, config.capture.source, config.playback.output
    );

    let session = VoiceSession::new(config);
    let mut states = session.subscribe();
    let mut transcript = session.subscribe_transcript();

    let started = session.start().await;
    println!("[{}]", session.state().status_text());
    started?;

    let mut last_state = session.state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                break;
            }
            entry = transcript.recv() => match entry {
                Ok(entry) => {
                    let who = match entry.role {
                        Role::Agent => "Agent",
                        Role::Caller => "You",
                    };
                    println!("{}: {}", who, entry.text);
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} transcript lines", n),
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                last_state = states.borrow_and_update().clone();
                println!("[{}]", last_state.status_text());
                if !last_state.is_active() {
                    break;
                }
            }
        }
    }

    let stats = session.stop().await;
    info!(
        "Call lasted {:.1}s: {} frames sent, {} suppressed, {} agent chunks, {} reconnects",
        stats.duration_secs,
        stats.frames_sent,
        stats.frames_suppressed,
        stats.chunks_received,
        stats.reconnect_attempts
    );

    if let Some(path) = transcript_out {
        session.transcript().await.save(&path).await?;
        info!("Transcript saved to {}", path.display());
    }

    if let SessionState::Error { message, .. } = last_state {
        anyhow::bail!("call failed: {}", message);
    }
    Ok(())
}

async fn serve(config: SessionConfig, bind: &str, port: u16) -> Result<()> {
    let state = AppState::new(VoiceSession::new(config));
    let app = create_router(state.clone());

    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    state.session.stop().await;
    info!("Shut down");
    Ok(())
}
