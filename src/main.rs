use anyhow::Result;
use clap::{Parser, Subcommand};
use skylark::config::Config;
use skylark::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skylark", about = "Self-hosted realtime bioacoustic monitoring service")]
struct Cli {
    /// Path to config file (default: ~/.config/skylark/config.toml,
    /// overridable via SKYLARK_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the realtime analysis pipeline.
    RunRealtime,
    /// Run the classifier and filter chain over one audio file.
    AnalyzeFile { path: PathBuf },
    /// Analyze every audio file under a directory, recursively.
    AnalyzeDir { path: PathBuf },
    /// Print the species admitted by the configured range filter today.
    RangePrint,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    // A missing config file means defaults; an unreadable or invalid one is
    // a fatal configuration error.
    let cfg = if config_path.exists() {
        match Config::load_from(&config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error: {e:#}");
                return ExitCode::from(1);
            }
        }
    } else {
        tracing::warn!(path = %config_path.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Err(e) = cfg.validate() {
        eprintln!("error: {e}");
        return ExitCode::from(1);
    }

    let result: Result<i32> = match cli.command {
        Command::RunRealtime => skylark::supervisor::run(cfg),
        Command::AnalyzeFile { path } => skylark::analyze::analyze_file(&cfg, &path).map(|_| 0),
        Command::AnalyzeDir { path } => skylark::analyze::analyze_dir(&cfg, &path).map(|_| 0),
        Command::RangePrint => skylark::analyze::range_print(&cfg).map(|_| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {e:#}");
            // Configuration faults discovered past startup keep their own
            // exit code; everything else is an unrecoverable runtime error.
            if e.downcast_ref::<Error>().map(|err| matches!(err, Error::Config { .. })).unwrap_or(false)
            {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}
