mod checks;
mod config;
mod error;
mod extract;
mod line_source;
mod patterns;
mod report;
mod runner;
#[cfg(test)]
mod testing;
mod types;
mod waiter;

use anyhow::Result;
use clap::Parser;
use line_source::{LineSource, LineStream, SerialConnector};
use log::{debug, info};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::init();
    runner::install_panic_hook();

    // Parse command-line arguments; a missing port is a usage error (exit 1)
    let cli = match config::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return Ok(ExitCode::from(1));
        }
        Err(e) => e.exit(),
    };

    let config = config::load_config(&cli)?;
    let patterns = patterns::PatternSet::with_overrides(&config.patterns)?;
    info!("Configuration loaded for {}", config.usb_port);

    let connector = SerialConnector::new(config.usb_port.clone(), config.baud_rate);

    if cli.monitor {
        monitor(connector, &config).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut runner = runner::CheckRunner::new(checks::default_checks(), config, patterns);
    let report = runner.run(connector).await;
    debug!("Runner stopped in state {:?}", runner.state());

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
    }

    Ok(ExitCode::from(report.exit_code()))
}

/// Prints every device line until Ctrl+C, riding out disconnects.
async fn monitor(connector: SerialConnector, config: &config::HarnessConfig) -> Result<()> {
    println!("Serial Monitor - {} @ {} baud", config.usb_port, config.baud_rate);
    println!("Auto-reconnect enabled. Press Ctrl+C to exit.\n");

    let mut source = LineSource::open_with_retry(
        connector,
        config.reconnect_backoff(),
        config.connect_attempts,
    )
    .await?;
    println!("{}", "=".repeat(60));

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            line = source.next_line(config.poll_interval()) => {
                if let Some(line) = line {
                    println!("{}", line.text);
                }
            }
            _ = &mut interrupted => {
                println!("\n\nExiting...");
                return Ok(());
            }
        }
    }
}
