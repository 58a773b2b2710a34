use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    name = "godice-probe",
    version,
    about = "Runs the GoDice firmware conformance checks over a serial port"
)]
pub struct Cli {
    /// Serial port the board is attached to (e.g. COM3 or /dev/ttyUSB0)
    pub port: String,

    /// Path to an optional configuration file
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Override serial baud rate
    #[clap(long)]
    pub baud: Option<u32>,

    /// Override the delay after connecting before the first check, in seconds
    #[clap(long)]
    pub settle_secs: Option<u64>,

    /// Print the summary as JSON instead of text
    #[clap(long)]
    pub json: bool,

    /// Do not echo device lines while checks are waiting
    #[clap(long)]
    pub no_echo: bool,

    /// Only print device output, reconnecting as needed, until Ctrl+C
    #[clap(long)]
    pub monitor: bool,
}

/// Per-check time budgets. Fields without a unit suffix are seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckTimeouts {
    pub boot: u64,
    pub scan: u64,
    pub discovery: u64,
    pub connected: u64,
    pub color: u64,
    pub battery: u64,
    pub rolling: u64,
    pub stable: u64,
    pub stability_window: u64,
    pub indicator_settle_ms: u64,
    pub indicator_hold_ms: u64,
}

impl Default for CheckTimeouts {
    fn default() -> Self {
        Self {
            boot: 5,
            scan: 5,
            discovery: 30,
            connected: 15,
            color: 10,
            battery: 10,
            rolling: 30,
            stable: 10,
            stability_window: 60,
            indicator_settle_ms: 500,
            indicator_hold_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub usb_port: String,
    pub baud_rate: u32,
    pub settle_secs: u64,
    pub inter_check_pause_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_backoff_secs: u64,
    pub connect_attempts: u32,
    pub echo: bool,
    pub timeouts: CheckTimeouts,
    /// Replacement expressions keyed by pattern name.
    pub patterns: HashMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            usb_port: String::new(),
            baud_rate: 115200,
            settle_secs: 2,
            inter_check_pause_ms: 1000,
            poll_interval_ms: 20,
            reconnect_backoff_secs: 2,
            connect_attempts: 3,
            echo: true,
            timeouts: CheckTimeouts::default(),
            patterns: HashMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn inter_check_pause(&self) -> Duration {
        Duration::from_millis(self.inter_check_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

pub fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match cli.config {
        Some(ref path) => {
            let config_content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&config_content).context("Failed to parse config file")?
        }
        None => HarnessConfig::default(),
    };

    // Apply CLI overrides
    config.usb_port = cli.port.clone();

    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }

    if let Some(settle_secs) = cli.settle_secs {
        config.settle_secs = settle_secs;
    }

    if cli.no_echo {
        config.echo = false;
    }

    if config.connect_attempts == 0 {
        anyhow::bail!("connect_attempts must be at least 1");
    }

    Ok(config)
}
