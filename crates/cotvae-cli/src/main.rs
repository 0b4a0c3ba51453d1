use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::train::TrainArgs;
use config::load_config;

/// cotvae — variational chain-of-thought compression training
#[derive(Debug, Parser)]
#[command(name = "cotvae", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train an encoder/student pair to answer from compressed reasoning traces.
    ///
    /// MEMORY: two GPT-2 small copies plus AdamW state need roughly 3 GB in
    /// F32; GPT-2 medium roughly 9 GB.
    Train(TrainArgs),

    /// Combine consecutive pairs of example lines into two-problem lines.
    Reform {
        /// Input data file.
        #[arg(long, value_name = "FILE")]
        path: PathBuf,

        /// Output file.
        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        /// Number of combined lines to write.
        #[arg(long, default_value_t = 1)]
        num_lines: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Train(args) => {
            commands::train::run(&args, &cfg)?;
        }
        Commands::Reform { path, out, num_lines } => {
            commands::reform::run(&path, &out, num_lines)?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reform_defaults_to_one_line() {
        let cli = Cli::parse_from(["cotvae", "reform", "--path", "in.txt", "--out", "out.txt"]);
        match cli.command {
            Commands::Reform { num_lines, .. } => assert_eq!(num_lines, 1),
            other => panic!("expected reform, got {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from([
            "cotvae", "train", "--train", "t.txt", "--val", "v.txt", "--log-format", "json",
        ]);
        assert_eq!(cli.log_format, "json");
        assert!(matches!(cli.command, Commands::Train(_)));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
