use callcore::calls::CallControl;
use callcore::{Backend, CallEvent, CallState, Client, ClientConfig};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// A small softphone on top of the call core.
//
// Usage:
//   callcore --config phone.json register
//   callcore --config phone.json call 2001
//   callcore --config phone.json call sip:echo@pbx.example.com --inject greeting.wav
//   callcore --config phone.json --backend direct listen --auto-answer

const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "callcore")]
#[command(about = "SIP softphone over a WebRTC signaling gateway or a SIP WebSocket relay")]
struct Cli {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Gateway,
    Direct,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Gateway => Backend::Gateway,
            BackendArg::Direct => Backend::Direct,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Registers the account and exits.
    Register,
    /// Places a call and waits until it ends.
    Call {
        target: String,
        #[arg(short, long)]
        device: Option<String>,
        /// WAV file played to the far end once the call is answered.
        #[arg(short, long)]
        inject: Option<PathBuf>,
    },
    /// Waits for incoming calls.
    Listen {
        #[arg(short, long)]
        auto_answer: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }

    let client = Client::init(config)?;
    let calls = client.calls().clone();
    let mut events = client.subscribe();

    calls.register().await?;
    if !wait_registered(&mut events).await {
        client.shutdown().await;
        anyhow::bail!("registration did not complete");
    }

    let outcome = match cli.command {
        Commands::Register => Ok(()),
        Commands::Call {
            target,
            device,
            inject,
        } => run_call(&calls, &mut events, &target, device.as_deref(), inject).await,
        Commands::Listen { auto_answer } => listen(&calls, &mut events, auto_answer).await,
    };

    client.shutdown().await;
    outcome
}

async fn wait_registered(events: &mut broadcast::Receiver<CallEvent>) -> bool {
    let outcome = tokio::time::timeout(REGISTER_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::Registered { uri }) => {
                    info!("Registered as {uri}");
                    return true;
                }
                Ok(CallEvent::RegistrationFailed { code, reason }) => {
                    error!("Registration failed ({code:?}): {reason}");
                    return false;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    outcome.unwrap_or_else(|_| {
        error!("Timed out waiting for registration");
        false
    })
}

async fn run_call(
    calls: &Arc<dyn CallControl>,
    events: &mut broadcast::Receiver<CallEvent>,
    target: &str,
    device: Option<&str>,
    inject: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    calls.call(target, device).await?;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::Accepted) => {
                    info!("Call answered");
                    if let Some(path) = &inject
                        && let Err(e) = calls.inject_audio_file(path).await
                    {
                        warn!("Could not inject {}: {e}", path.display());
                    }
                }
                Ok(CallEvent::Ended { code, reason }) => {
                    info!("Call ended ({code:?}): {reason}");
                    return Ok(());
                }
                Ok(CallEvent::StateChanged(CallState::Idle)) => return Ok(()),
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                calls.hangup().await?;
                return Ok(());
            }
        }
    }
}

async fn listen(
    calls: &Arc<dyn CallControl>,
    events: &mut broadcast::Receiver<CallEvent>,
    auto_answer: bool,
) -> Result<(), anyhow::Error> {
    info!("Waiting for calls, Ctrl-C to quit");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::IncomingCall { caller, display_name, .. }) => {
                    info!("Incoming call from {} <{caller}>", display_name.as_deref().unwrap_or(""));
                    if auto_answer && let Err(e) = calls.answer(None, None).await {
                        warn!("Answer failed: {e}");
                    }
                }
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged(state) => info!("State: {state}"),
        CallEvent::Track(track) => info!("Remote audio: {} ({})", track.id, track.codec),
        other => info!("{}: {other:?}", other.kind().as_str()),
    }
}
