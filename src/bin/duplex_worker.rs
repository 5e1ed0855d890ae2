use std::{error::Error, path::PathBuf, process, time::Duration};

use clap::{Parser, ValueEnum};
use duplex_worker::{
    WorkerConfig, WorkerSession,
    config::DEFAULT_MAX_CHUNK_SIZE,
    handlers::{self, BodySource},
};
use log::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Send 100-103 provisional responses before the streamed 200
    EarlyHints,
    /// Send the streamed 200 directly
    Stream,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// File streamed as the body of every response
    source: PathBuf,
    /// Handler used for every request
    #[arg(long, value_enum, default_value_t = Mode::Stream)]
    mode: Mode,
    /// Pause before producing each chunk, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Maximum number of chunks per response
    #[arg(long)]
    limit: Option<usize>,
    /// Split each line on this ASCII character
    #[arg(long)]
    separator: Option<char>,
    /// Largest StreamChunk frame, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK_SIZE)]
    max_chunk_size: usize,
    /// Close streams after this many body bytes
    #[arg(long)]
    max_stream_bytes: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // env_logger writes to stderr; stdout carries the protocol.
    env_logger::init();

    let cli = Cli::parse();
    let config = WorkerConfig {
        max_chunk_size: cli.max_chunk_size,
        max_stream_bytes: cli.max_stream_bytes,
        ..WorkerConfig::default()
    };
    config.validate()?;

    let separator = cli
        .separator
        .map(u8::try_from)
        .transpose()
        .map_err(|_| "separator must be an ASCII character")?;
    let source = BodySource {
        path: cli.source,
        separator,
        delay: cli.delay_ms.map(Duration::from_millis),
        limit: cli.limit,
    };

    let session = WorkerSession::stdio(&config);
    let shutdown = session.shutdown_signal();
    ctrlc::set_handler(move || shutdown.stop())?;

    info!("serving requests in {:?} mode", cli.mode);
    let result = match cli.mode {
        Mode::EarlyHints => session.serve(|s, req| handlers::early_hints(s, req, &source)),
        Mode::Stream => session.serve(|s, req| handlers::stream_body(s, req, &source)),
    };

    if let Err(e) = result {
        error!("worker stopped: {e}");
        process::exit(1);
    }
    Ok(())
}
