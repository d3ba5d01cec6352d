//! Daemon entrypoint: bind the socket, wire the engine, accept.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use wayline::config::Config;
use wayline::daemon::auth::{AuthGate, KeyedDigestVerifier};
use wayline::daemon::broadcast::EventBus;
use wayline::daemon::server::{self, ServerState};
use wayline::engine::apply::ChangeEngine;
use wayline::engine::resolver::EdgeResolver;
use wayline::engine::store::{GraphStore, JsonDirPersistence};
use wayline::telemetry;

#[derive(Parser, Debug)]
#[command(name = "waylined", about = "Itinerary change engine daemon")]
struct Args {
    /// Unix socket to listen on.
    #[arg(long, default_value = "/tmp/waylined.sock")]
    socket: PathBuf,

    /// Config file (JSON). Defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for write-through itinerary documents.
    #[arg(long, default_value = "./wayline-data")]
    data_dir: PathBuf,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match args
        .config
        .as_deref()
        .map(Config::load)
        .unwrap_or_else(|| Ok(Config::default()))
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config load failed: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    telemetry::init(args.verbose, &config.logging);

    let persistence = match JsonDirPersistence::new(&args.data_dir) {
        Ok(persistence) => persistence,
        Err(err) => {
            eprintln!("data dir init failed: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let store = Arc::new(GraphStore::new(Arc::new(persistence)));
    let bus = Arc::new(EventBus::new(
        config.limits.max_subscribers_per_itinerary,
        config.limits.subscriber_queue_events,
    ));
    let engine = Arc::new(ChangeEngine::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        EdgeResolver::new(config.edge_day_preference),
        config.limits.clone(),
    ));
    let gate = AuthGate::new(Arc::new(KeyedDigestVerifier::new(
        config.auth.shared_secret.clone().into_bytes(),
    )));

    // A stale socket file from a previous run blocks bind.
    let _ = std::fs::remove_file(&args.socket);
    let listener = match std::os::unix::net::UnixListener::bind(&args.socket) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("bind failed on {}: {err}", args.socket.display());
            return std::process::ExitCode::FAILURE;
        }
    };
    tracing::info!(socket = %args.socket.display(), "waylined listening");

    let state = ServerState::new(engine, bus, gate);
    match server::run_server(listener, state) {
        Ok(()) => {
            let _ = std::fs::remove_file(&args.socket);
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "server failed");
            std::process::ExitCode::FAILURE
        }
    }
}
