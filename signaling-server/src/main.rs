//! Rendezvous signaling relay server
//!
//! Relays hex-framed handshake signals between registered peers.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use signaling_server::{RelayServer, ServerConfig};

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    // --listen <addr:port>  Listen address (default 0.0.0.0:10000)
    // --max-line <bytes>    Longest accepted line (default 65536)
    // --max-pending <bytes> Send buffer per client (default 1048576)
    // --metrics <path>      Prometheus text file, rewritten periodically
    // --log <path>          Log to file instead of stderr
    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    init_logging(config.log_path.as_deref())?;

    log::info!("Rendezvous signaling relay starting...");
    log::info!("  Listen:   {}", config.listen_addr);
    log::info!("  Max line: {} bytes", config.max_line_len);
    log::info!("  Pending:  {} bytes per client", config.max_pending_bytes);
    if let Some(path) = &config.metrics_path {
        log::info!("  Metrics:  {}", path.display());
    }
    log::info!("  Stats:    every {}s", config.stats_interval.as_secs());

    // SIGINT/SIGTERM request a clean shutdown
    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let mut server = RelayServer::bind(config)?;
    server.run(&shutdown)?;
    Ok(())
}

fn init_logging(log_path: Option<&Path>) -> std::io::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(path) = log_path {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
