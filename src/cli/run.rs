use std::path::PathBuf;

use anyhow::bail;
use clap::Args;
use tracing::{error, info};

use binmux::config::{EnvConfigSource, MessengerSettings};
use binmux::demo::run_loopback;
use binmux::logger::{LogLevel, init_tracing};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of pings to send
    #[arg(long, default_value_t = 10)]
    pub count: usize,

    /// `.env` file with BINMUX_* settings
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error, critical)
    #[arg(long)]
    pub log_level: Option<LogLevel>,
}

impl RunArgs {
    pub fn default_run() -> Self {
        Self {
            count: 10,
            env_file: None,
            log_level: None,
        }
    }
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let source = EnvConfigSource::new(args.env_file);
    let mut settings = MessengerSettings::load(&source).await?;
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }
    let _guard = init_tracing(settings.log_level, settings.log_dir.as_deref())?;
    info!(?settings, "binmux starting");

    let report = run_loopback(&settings, args.count).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        error!(?report, "loopback run left work behind");
        bail!(
            "{} of {} pings answered, {} replies pending, {} messages unreleased",
            report.pongs_received,
            report.pings_sent,
            report.pending_replies,
            report.outstanding_messages
        );
    }
    info!("all replies delivered and all message tokens released");
    Ok(())
}
