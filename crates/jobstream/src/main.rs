//! jobstream - follow a background job event stream from the terminal
//!
//! Prints every job update as a JSON line on stdout and logs connection state
//! changes on stderr. On Ctrl-C the final snapshot is printed.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use jobstream::{ConnectionManager, ConnectionStatus, Credentials, StreamConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "jobstream")]
#[command(about = "Follow a background job event stream")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print job updates until interrupted
    Watch {
        /// Event stream URL
        #[arg(long, env = "JOBSTREAM_URL")]
        url: String,

        /// Session cookie sent with every connection attempt
        #[arg(long, env = "JOBSTREAM_COOKIE", conflicts_with = "token")]
        cookie: Option<String>,

        /// Bearer token sent with every connection attempt
        #[arg(long, env = "JOBSTREAM_TOKEN")]
        token: Option<String>,

        /// Path to config file
        #[arg(short, long, env = "JOBSTREAM_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Generate a config file with the default settings
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "jobstream.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries job updates, so logs go to stderr
    let filter = EnvFilter::from_default_env().add_directive("jobstream=info".parse()?);
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init(),
    }

    match cli.command {
        Commands::Watch {
            url,
            cookie,
            token,
            config,
        } => {
            watch(url, credentials(cookie, token), config).await?;
        }

        Commands::InitConfig { output, force } => {
            init_config(&output, force)?;
        }
    }

    Ok(())
}

fn credentials(cookie: Option<String>, token: Option<String>) -> Credentials {
    match (cookie, token) {
        (Some(cookie), _) => Credentials::Cookie(cookie),
        (None, Some(token)) => Credentials::Bearer(token),
        (None, None) => Credentials::None,
    }
}

async fn watch(
    url: String,
    credentials: Credentials,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => StreamConfig::from_file(path)?,
        None => StreamConfig::default(),
    };
    info!(
        url = %url,
        heartbeat_timeout_ms = config.heartbeat_timeout_ms,
        max_reconnect_attempts = config.max_reconnect_attempts,
        "starting jobstream"
    );

    let manager = ConnectionManager::new(config)?;
    manager.on_job_update(|job| match serde_json::to_string(job) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(job_id = %job.id, error = %e, "failed to encode job"),
    });
    manager.on_connection_state_change(|change| {
        info!(
            from = %change.previous,
            to = %change.current,
            attempts = change.attempts,
            retry_in_ms = change.retry_in.map(|d| d.as_millis()),
            cause = change.cause.as_ref().map(tracing::field::display),
            "connection state changed"
        );
    });

    let handle = manager.subscribe(&url, credentials)?;
    let mut status = manager.watch_status(handle)?;

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupted, disconnecting");
            None
        }
        fatal = async {
            status
                .wait_for(ConnectionStatus::is_fatal)
                .await
                .ok()
                .and_then(|s| s.fatal.clone())
        } => fatal,
    };

    manager.shutdown(handle).await?;

    let snapshot = manager.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot.sorted())?);

    match fatal {
        Some(e) => Err(e).context("job stream unavailable"),
        None => Ok(()),
    }
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            output.display()
        );
    }

    let json = StreamConfig::default().to_json()?;
    std::fs::write(output, json)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Config written to: {}", output.display());
    Ok(())
}
