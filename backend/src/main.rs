use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use fringe_backend::config::{parse_baselines, BackendConfig, Block};
use fringe_backend::server::{serve, Backend};

/// Antennas of the array, reference first; the listed order fixes the
/// default input mapping and the answer order of empty-argument gets.
const ANTENNAS: [u8; 8] = [6, 1, 2, 3, 4, 5, 7, 8];

#[derive(Parser, Debug)]
#[command(name = "fringe-backend", about = "Phased-array interferometer control backend")]
struct Args {
    /// Address to bind the command server on
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    host: String,
    /// TCP port for the command protocol
    #[arg(short, long, default_value_t = 59999)]
    port: u16,
    /// Baselines to track, e.g. "6-*" or "1-6,2-6"; defaults to every
    /// baseline containing the reference antenna
    #[arg(short, long)]
    baselines: Option<String>,
    /// Which antenna the correlator forms baselines against
    #[arg(short, long, default_value_t = 6)]
    reference: u8,
    /// Board block to attach to
    #[arg(long, value_enum, default_value = "high")]
    block: Block,
    /// Optional toml file overriding board addresses
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Only print ERROR messages or higher
    #[arg(short, long)]
    quiet: bool,
    /// Print DEBUG messages
    #[arg(short = 'v', long)]
    debug: bool,
    /// Also write a detailed log to FILE
    #[arg(short, long, value_name = "FILE")]
    logfile: Option<PathBuf>,
}

/// Clonable writer over one shared log file.
#[derive(Clone)]
struct LogFile(Arc<File>);

impl std::io::Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let console_level = if args.quiet {
        LevelFilter::ERROR
    } else if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let console = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!(
                "fringe_backend={console_level},fringe_proto=info"
            ))
        }),
    );
    let file_layer = match &args.logfile {
        Some(path) => {
            let file = LogFile(Arc::new(File::create(path)?));
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(move || file.clone())
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };
    tracing_subscriber::registry().with(console).with(file_layer).init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("could not set up logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match BackendConfig::load(args.block, args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pattern = args
        .baselines
        .clone()
        .unwrap_or_else(|| format!("{}-*", args.reference));
    let baselines = parse_baselines(&pattern, &ANTENNAS);
    info!("tracking {} baseline(s) from pattern {pattern:?}", baselines.len());

    let backend = Backend::build(
        args.block,
        config,
        ANTENNAS.to_vec(),
        args.reference,
        baselines,
    );
    backend.setup().await;

    let bind = format!("{}:{}", args.host, args.port);
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind {bind}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("serving on {bind}");

    if let Err(e) = serve(backend, listener).await {
        error!("server failed: {e}");
        return ExitCode::FAILURE;
    }
    info!("exiting");
    ExitCode::SUCCESS
}
