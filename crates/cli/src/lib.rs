pub mod commands;
pub mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use stepwise_core::config::{AppConfig, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "stepwise",
    about = "Stepwise operator CLI",
    long_about = "Run conversation turns against a local thread store and inspect configuration.",
    after_help = "Examples:\n  stepwise ask --thread demo --message \"How did AAPL trade this week?\"\n  stepwise config"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a stepwise.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run one conversation turn and print the reply as JSON")]
    Ask {
        #[arg(long, help = "Conversation thread id")]
        thread: String,
        #[arg(long, help = "User message for this turn")]
        message: String,
        #[arg(
            long,
            default_value = ".stepwise/threads",
            help = "Directory holding one JSON file per thread"
        )]
        store_dir: PathBuf,
    },
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ask { thread, message, store_dir } => {
            commands::ask::run(commands::ask::AskOptions {
                config_path: cli.config,
                thread_id: thread,
                message,
                store_dir,
            })
            .await
        }
        Command::Config => commands::config::run(cli.config.as_deref()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Installs the global subscriber. Logs go to stderr so stdout stays a
/// single JSON payload.
pub fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}
