use std::{
    collections::HashMap,
    error::Error,
    process,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use clap::{command, Parser, ValueHint};
use exponential_backoff::Backoff;
use log::{debug, error, info, LevelFilter};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vesper::{
    auth::Authenticator,
    channel::Session,
    client::{InteractiveLogin, LoginCode, VoiceClient},
    command::{Media, MediaKey},
    config::Config,
    engine::{
        AlertScheduler, AudioSink, Engine, MediaKeys, PlayerFeedback, SpeakerState, SystemAudio,
    },
    http,
    tokens::TokenStore,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Consecutive session failures tolerated before giving up.
const RESTART_ATTEMPTS: u32 = 8;

/// A session that lasted this long resets the restart backoff.
const STEADY_SESSION: Duration = Duration::from_secs(60);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Holds the OAuth client id and redirect URI registered with the
    /// identity provider. Keep this file secure and do not share it
    /// publicly.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Tokens file
    ///
    /// Where access and refresh tokens are persisted across restarts.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("tokens.toml"))]
    tokens_file: String,

    /// Device name
    ///
    /// Set the device name as it is reported to the voice service.
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname)]
    name: Option<String>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Contents of the secrets file.
#[derive(Debug, Deserialize)]
struct Secrets {
    client_id: String,
    redirect_uri: String,
}

impl Secrets {
    fn from_file(path: &str) -> Result<Self, Box<dyn Error>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                info!("read the documentation on how to set up {path}");
            }
            e
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Reads the authorization code from standard input.
///
/// The identity provider's own authorization UI is out of scope here; the
/// user completes it in a browser and pastes the resulting code.
struct ConsoleLogin;

#[async_trait]
impl InteractiveLogin for ConsoleLogin {
    async fn obtain_code(&self) -> vesper::error::Result<LoginCode> {
        println!("Complete the login in your browser, then paste the authorization code:");
        let code = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map(|_| line.trim().to_owned())
        })
        .await
        .map_err(|e| vesper::error::Error::internal(e.to_string()))??;

        if code.is_empty() {
            return Err(vesper::error::Error::unauthenticated(
                "no authorization code entered",
            ));
        }
        Ok(LoginCode {
            code,
            verifier: None,
        })
    }
}

/// Audio sink for a build without an audio device.
///
/// Logs each item and reports an immediate full run so the queue keeps
/// draining and the service sees a complete lifecycle.
struct NullSink {
    feedback: mpsc::UnboundedSender<PlayerFeedback>,
}

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&mut self, media: &Media) -> vesper::error::Result<()> {
        if let Some(audio) = &media.audio {
            info!("speaking {} bytes of synthesized audio", audio.len());
        } else {
            info!("playing stream {}", media.url);
        }

        let _ = self.feedback.send(PlayerFeedback::Progress {
            token: media.token.clone(),
            position: media.offset,
            percent: 1.0,
        });
        let _ = self.feedback.send(PlayerFeedback::Completed {
            token: media.token.clone(),
        });
        Ok(())
    }

    async fn stop(&mut self) {
        debug!("playback stopped");
    }
}

/// In-process speaker state.
struct Speaker {
    volume: i64,
    muted: bool,
}

impl SystemAudio for Speaker {
    fn set_volume(&mut self, volume: i64) -> SpeakerState {
        self.volume = volume.clamp(0, 100);
        info!("volume set to {}", self.volume);
        SpeakerState {
            volume: self.volume,
            muted: self.muted,
        }
    }

    fn adjust_volume(&mut self, delta: i64) -> SpeakerState {
        self.set_volume(self.volume + delta)
    }

    fn set_mute(&mut self, mute: bool) -> SpeakerState {
        self.muted = mute;
        info!("{}", if mute { "muted" } else { "unmuted" });
        SpeakerState {
            volume: self.volume,
            muted: self.muted,
        }
    }
}

/// Logs transport keys; a headless build has no media session to inject
/// them into.
struct LogKeys;

impl MediaKeys for LogKeys {
    fn press(&mut self, key: MediaKey) {
        info!("transport key: {key:?}");
    }
}

/// Timer-backed alert scheduler.
///
/// Fired tokens flow back into the session loop, which reports the alert
/// lifecycle to the service.
struct TimerAlerts {
    fired: mpsc::UnboundedSender<String>,
    pending: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl AlertScheduler for TimerAlerts {
    fn schedule(&mut self, token: &str, delay: Duration) -> vesper::error::Result<()> {
        self.cancel(token);
        let fired = self.fired.clone();
        let fired_token = token.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(fired_token);
        });
        self.pending.insert(token.to_owned(), handle);
        Ok(())
    }

    fn cancel(&mut self, token: &str) {
        if let Some(handle) = self.pending.remove(token) {
            handle.abort();
        }
    }
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
        logger.filter_module("vesper", level);
    }

    logger.init();
}

/// Main application loop.
///
/// Builds the composition root, then supervises the session: the session
/// itself never loop-retries, so reconnection policy lives here, with
/// exponential backoff between consecutive failures and a reset once a
/// session holds steady.
///
/// # Errors
///
/// This function returns an error when the configuration cannot be loaded
/// or the session keeps failing past the retry budget.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let secrets = Secrets::from_file(&args.secrets_file)?;

    let mut config = Config::new(secrets.client_id, secrets.redirect_uri);
    config.tokens_file = args.tokens_file;
    config.device_name = args
        .name
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| config.app_name.clone());

    let http = Arc::new(http::Client::new(&config)?);
    let store = Arc::new(TokenStore::load(&config.tokens_file)?);
    let auth = Arc::new(Authenticator::new(
        &config,
        Arc::clone(&http),
        Arc::clone(&store),
    ));
    let client = Arc::new(VoiceClient::new(
        config.clone(),
        http,
        auth,
        Arc::new(ConsoleLogin),
    ));

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (notices_tx, notices_rx) = mpsc::unbounded_channel();
    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
    let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();

    let engine = Engine::new(
        Box::new(NullSink {
            feedback: feedback_tx,
        }),
        Box::new(Speaker {
            volume: 50,
            muted: false,
        }),
        Box::new(LogKeys),
        Box::new(TimerAlerts {
            fired: alerts_tx,
            pending: HashMap::new(),
        }),
        outbox_tx,
        notices_tx,
    );

    let cancel = CancellationToken::new();
    let mut session = Session::new(
        client,
        engine,
        outbox_rx,
        notices_rx,
        feedback_rx,
        alerts_rx,
        cancel.clone(),
    );

    let backoff = Backoff::new(
        RESTART_ATTEMPTS,
        Duration::from_secs(1),
        Duration::from_secs(64),
    );
    let mut delays = backoff.iter();

    // The initial connection happens immediately.
    let restart_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(restart_timer);

    loop {
        let started_at = tokio::time::Instant::now();
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                cancel.cancel();
                break Ok(());
            }

            result = session.run(), if restart_timer.is_elapsed() => {
                match result {
                    Ok(()) => break Ok(()),
                    Err(e) => error!("{e}"),
                }

                // A session that held for a while earns a fresh budget.
                if started_at.elapsed() >= STEADY_SESSION {
                    delays = backoff.iter();
                }

                match delays.next() {
                    Some(Some(delay)) => {
                        // Jitter spreads reconnects to prevent thundering
                        // herds against the service.
                        let wait = delay + Duration::from_millis(fastrand::u64(0..1_000));
                        info!("restarting in {:.1}s", wait.as_secs_f32());
                        restart_timer.as_mut().reset(tokio::time::Instant::now() + wait);
                    }
                    _ => break Err("too many consecutive session failures".into()),
                }
            }

            () = &mut restart_timer, if !restart_timer.is_elapsed() => {}
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
