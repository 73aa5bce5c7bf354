//! rdc-client: entry point.
//!
//! ```text
//! rdc-client                          Connect using rdc-client.toml
//! rdc-client --config <path>          Use a custom config TOML
//! rdc-client --host <h> --user <u>    Override the target
//! rdc-client --print-config           Dump the default config and exit
//! rdc-client --write-config <path>    Write the default config and exit
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rdc_core::{ConnectionError, Session, SessionStats};

use rdc_client::config::ClientConfig;
use rdc_client::display::Framebuffer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rdc-client", about = "Headless remote desktop client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rdc-client.toml")]
    config: PathBuf,

    /// Remote host (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Remote port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// User name (overrides config).
    #[arg(short, long)]
    user: Option<String>,

    /// Write the final screen to this PPM file.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    print_config: bool,

    /// Write the default configuration to this file and exit.
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        return match ClientConfig::default_toml() {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot render default config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(path) = &cli.write_config {
        return match ClientConfig::write_default(path) {
            Ok(()) => {
                println!("default config written to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot write {}: {e}", path.display());
                ExitCode::FAILURE
            }
        };
    }

    let mut config = match ClientConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(host) = cli.host {
        config.session.host = host;
    }
    if let Some(port) = cli.port {
        config.session.port = port;
    }
    if let Some(user) = cli.user {
        config.session.username = user;
    }
    if cli.snapshot.is_some() {
        config.output.snapshot = cli.snapshot;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rdc-client v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        ConnectionError::None => ExitCode::SUCCESS,
        kind => {
            error!(?kind, "session failed");
            ExitCode::from(exit_code(kind))
        }
    }
}

fn exit_code(kind: ConnectionError) -> u8 {
    match kind {
        ConnectionError::None => 0,
        ConnectionError::TimeOut => 2,
        ConnectionError::HostResolution => 3,
        ConnectionError::General => 4,
        ConnectionError::Canceled => 5,
    }
}

async fn run(config: ClientConfig) -> ConnectionError {
    let mut session = match Session::new(config.session.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!("invalid configuration: {e}");
            return e.kind();
        }
    };

    // ── 1. Cancellation and statistics ──────────────────────────

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; disconnecting");
            cancel.cancel();
        }
    });

    let stats_rx = session.stats();
    let interval = config.logging.stats_interval_secs;
    let reporter = (interval > 0).then(|| {
        let mut rx = stats_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(interval));
            tick.tick().await;
            loop {
                tick.tick().await;
                if rx.has_changed().is_err() {
                    break;
                }
                log_stats(&rx.borrow_and_update());
            }
        })
    });

    // ── 2. Connect ──────────────────────────────────────────────

    if let Err(e) = session.connect().await {
        error!("connect failed: {e}");
        return session.error();
    }
    let (width, height, depth) = session.desktop();
    info!(width, height, depth, "connected");

    // ── 3. Main loop ────────────────────────────────────────────

    let mut screen = Framebuffer::new(width, height, depth);
    if let Err(e) = session.run(&mut screen).await {
        warn!("session ended: {e}");
    }
    if let Some(reason) = session.disconnect_reason() {
        info!(reason, "server disconnect reason");
    }

    // ── 4. Shutdown ─────────────────────────────────────────────

    if let Some(handle) = reporter {
        handle.abort();
    }
    log_stats(&stats_rx.borrow());
    let drawn = screen.stats();
    info!(
        drawn = drawn.drawn,
        skipped = drawn.skipped,
        updates = drawn.updates,
        bells = drawn.bells,
        "framebuffer"
    );
    if let Some(path) = &config.output.snapshot {
        match screen.save_ppm(path) {
            Ok(()) => info!("screen written to {}", path.display()),
            Err(e) => warn!("cannot write {}: {e}", path.display()),
        }
    }
    session.error()
}

fn log_stats(stats: &SessionStats) {
    info!(
        frames = stats.frames,
        fast_path = stats.fast_path_frames,
        bytes = stats.bytes,
        channel_messages = stats.channel_messages,
        activations = stats.activations,
        "session stats"
    );
}
