//! Murmure host application.
//!
//! Wires identity, configuration, logging and the call engine together and
//! exposes a line-oriented console for placing and answering calls. The mesh
//! transport itself is an external component; this binary runs against the
//! in-memory transport so a node can be exercised end to end on one machine,
//! and embedders swap in the real transport behind the same seam.
//!
//! Exit codes: 0 success, 1 identity error, 2 transport initialisation
//! error, other non-zero for uncategorised errors.

mod console;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use murmure_core::{CallEngine, Clock, EngineConfig, SystemClock};
use murmure_net::{MockNetwork, MockTransport, Transport};
use murmure_shared::identity::Identity;
use murmure_shared::protocol::CodecOffer;
use murmure_store::history::derive_history_key;
use murmure_store::{paths, CallHistory, Config, PeersStore};

#[derive(Parser, Debug)]
#[command(name = "murmure", version, about = "Encrypted voice calls over a mesh network")]
struct Cli {
    /// Path to the identity file (default: <config dir>/identity)
    #[arg(long, value_name = "PATH")]
    identity: Option<PathBuf>,

    /// Generate a fresh identity, replacing any existing one
    #[arg(long)]
    new_identity: bool,

    /// Print the node id and public key, then exit
    #[arg(long)]
    show_identity: bool,

    /// Audio input device index (default: system default)
    #[arg(long, value_name = "N")]
    audio_input_device: Option<usize>,

    /// Audio output device index (default: system default)
    #[arg(long, value_name = "N")]
    audio_output_device: Option<usize>,

    /// Run without audio devices (signaling and links only)
    #[arg(long)]
    no_audio: bool,

    /// Do not announce presence on startup or periodically
    #[arg(long)]
    no_announce: bool,

    /// Minutes between presence announces
    #[arg(long, value_name = "MIN")]
    announce_period: Option<u64>,

    /// Display name carried in announces and invites
    #[arg(long, value_name = "NAME")]
    display_name: Option<String>,

    /// Log filter (e.g. info, debug, murmure_core=trace)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log to this file instead of the default log file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log to stderr only
    #[arg(long)]
    no_log_file: bool,
}

fn init_logging(cli: &Cli, config_dir: &std::path::Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));

    if cli.no_log_file {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }

    let log_path = cli
        .log_file
        .clone()
        .unwrap_or_else(|| config_dir.join("murmure.log"));
    match std::fs::File::create(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        Err(err) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            error!(path = %log_path.display(), %err, "Could not open log file, logging to stderr");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_dir = match paths::config_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("murmure: cannot resolve config directory: {err}");
            return ExitCode::from(3);
        }
    };
    init_logging(&cli, &config_dir);

    let identity_path = cli
        .identity
        .clone()
        .unwrap_or_else(|| config_dir.join(paths::IDENTITY_FILE));
    let identity = match Identity::load_or_create(&identity_path, cli.new_identity) {
        Ok(identity) => identity,
        Err(err) => {
            eprintln!("murmure: identity error: {err}");
            return ExitCode::from(1);
        }
    };

    if cli.show_identity {
        println!("node id:    {}", identity.node_id());
        println!("public key: {}", identity.public_key_base64());
        return ExitCode::SUCCESS;
    }

    let mut config = Config::load(&config_dir.join(paths::CONFIG_FILE));
    if let Some(name) = &cli.display_name {
        config.ui.display_name = name.clone();
    }
    if let Some(device) = cli.audio_input_device {
        config.audio.input_device = Some(device);
    }
    if let Some(device) = cli.audio_output_device {
        config.audio.output_device = Some(device);
    }
    if cli.no_audio {
        config.audio.enabled = false;
    }
    if let Some(minutes) = cli.announce_period {
        config.network.announce_period_minutes = minutes;
    }
    config.save();

    // The in-memory transport stands in for the external mesh transport;
    // either way, startup failures surface here.
    let network = MockNetwork::new();
    let transport: Arc<dyn Transport> =
        match MockTransport::new(network, identity.public_key_bytes()) {
            Ok(transport) => transport,
            Err(err) => {
                eprintln!("murmure: transport error: {err}");
                return ExitCode::from(2);
            }
        };

    let engine_config = EngineConfig {
        display_name: (!config.ui.display_name.is_empty())
            .then(|| config.ui.display_name.clone()),
        codec: CodecOffer::new(config.codec.codec_type, config.codec.bitrate),
        target_jitter_ms: config.audio.target_jitter_ms,
        audio_enabled: config.audio.enabled,
        input_device: config.audio.input_device,
        output_device: config.audio.output_device,
        max_calls_per_minute: config.calls.max_per_minute,
        max_calls_per_hour: config.calls.max_per_hour,
        record_busy: config.calls.record_busy,
    };

    let peers = PeersStore::open(&config_dir.join(paths::PEERS_FILE));
    let history = CallHistory::open(
        &config_dir.join(paths::HISTORY_FILE),
        Some(derive_history_key(identity.secret_bytes())),
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (engine, events) = CallEngine::start(
        identity,
        transport,
        clock,
        engine_config,
        peers,
        history,
    );

    info!(node_id = %engine.local_node_id(), "Murmure ready");
    println!("node id: {}", engine.local_node_id());

    let announce = !cli.no_announce && config.network.announce_on_start;
    if announce {
        if let Err(err) = engine.announce_presence() {
            error!(%err, "Startup announce failed");
        }
    }

    let engine = Arc::new(engine);
    if announce {
        let period = config.network.announce_period_minutes.max(1);
        let announcer = engine.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(period * 60));
            ticker.tick().await; // first tick fires immediately; already announced
            loop {
                ticker.tick().await;
                if let Err(err) = announcer.announce_presence() {
                    error!(%err, "Periodic announce failed");
                }
            }
        });
    }

    match console::run(engine, events).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "Console error");
            ExitCode::from(10)
        }
    }
}
