//! The device checks, in the order the firmware exercises them.

use crate::config::CheckTimeouts;
use crate::extract::{extract, extract_int, extract_percentage, extract_text};
use crate::line_source::LineStream;
use crate::patterns::{Pattern, PatternSet};
use crate::types::{CheckVerdict, TelemetryRecord};
use crate::waiter::{PatternWaiter, WaitOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Command byte that turns the dice LEDs on.
pub const LED_ON: u8 = b'l';
/// Command byte that turns the dice LEDs off.
pub const LED_OFF: u8 = b'o';

pub const LOW_BATTERY_PERCENT: u8 = 20;

/// Everything a check may touch while it runs.
pub struct CheckContext<'a> {
    pub source: &'a mut dyn LineStream,
    pub waiter: &'a PatternWaiter,
    pub patterns: &'a PatternSet,
    pub timeouts: &'a CheckTimeouts,
    pub telemetry: &'a mut TelemetryRecord,
    pub advisories: &'a mut Vec<String>,
}

impl CheckContext<'_> {
    async fn wait(&mut self, pattern: &Pattern, timeout_secs: u64) -> WaitOutcome {
        self.waiter
            .wait_for(self.source, pattern, Duration::from_secs(timeout_secs))
            .await
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    /// Short key used in the report.
    fn name(&self) -> &'static str;

    fn title(&self) -> &'static str;

    /// Timeouts are ordinary failures and come back as `Ok`. An `Err` means
    /// the check could not do its job at all.
    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict>;
}

pub fn default_checks() -> Vec<Box<dyn Check>> {
    vec![
        Box::new(BootCheck),
        Box::new(ScanCheck),
        Box::new(ConnectionCheck),
        Box::new(ColorCheck),
        Box::new(BatteryCheck),
        Box::new(RollCheck),
        Box::new(IndicatorCheck),
        Box::new(StabilityCheck),
    ]
}

fn pass(message: &str) -> CheckVerdict {
    println!("✓ {}", message);
    CheckVerdict::pass()
}

fn fail(message: impl Into<String>) -> CheckVerdict {
    let message = message.into();
    println!("✗ {}", message);
    CheckVerdict::fail(message)
}

pub struct BootCheck;

#[async_trait]
impl Check for BootCheck {
    fn name(&self) -> &'static str {
        "boot"
    }

    fn title(&self) -> &'static str {
        "Boot Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        let patterns = ctx.patterns;
        Ok(match ctx.wait(&patterns.boot_banner, ctx.timeouts.boot).await {
            WaitOutcome::Matched { elapsed, .. } => {
                pass(&format!("Boot banner detected ({:.1?})", elapsed))
            }
            WaitOutcome::TimedOut { elapsed } => {
                fail(format!("Boot banner not detected within {:.1?}", elapsed))
            }
        })
    }
}

pub struct ScanCheck;

#[async_trait]
impl Check for ScanCheck {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn title(&self) -> &'static str {
        "BLE Scan Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        let patterns = ctx.patterns;
        Ok(match ctx.wait(&patterns.scan_start, ctx.timeouts.scan).await {
            WaitOutcome::Matched { elapsed, .. } => {
                pass(&format!("Scan started ({:.1?})", elapsed))
            }
            WaitOutcome::TimedOut { elapsed } => {
                fail(format!("Scan did not start within {:.1?}", elapsed))
            }
        })
    }
}

pub struct ConnectionCheck;

#[async_trait]
impl Check for ConnectionCheck {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn title(&self) -> &'static str {
        "Connection Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        println!("⏳ Waiting for dice connection (up to {} seconds)...", ctx.timeouts.discovery);

        let patterns = ctx.patterns;
        let found = ctx.wait(&patterns.dice_found, ctx.timeouts.discovery).await;
        let Some(found) = found.matched() else {
            return Ok(fail("No dice found during scan"));
        };

        // The address is informative only; a discovery line without one still counts.
        if let Some(mac) = extract_text(&found.text, &patterns.mac_address, "mac") {
            println!("✓ Dice found: {}", mac);
            ctx.telemetry.mac = Some(mac);
        }

        Ok(match ctx.wait(&patterns.dice_connected, ctx.timeouts.connected).await {
            WaitOutcome::Matched { .. } => pass("Dice connected successfully"),
            WaitOutcome::TimedOut { .. } => fail("Connection failed"),
        })
    }
}

pub struct ColorCheck;

#[async_trait]
impl Check for ColorCheck {
    fn name(&self) -> &'static str {
        "color"
    }

    fn title(&self) -> &'static str {
        "Color Detection Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        let patterns = ctx.patterns;
        let Some(line) = ctx.wait(&patterns.shell_color, ctx.timeouts.color).await.matched() else {
            return Ok(fail("Color not detected"));
        };

        let color = extract(&line.text, &patterns.shell_color)
            .and_then(|mut fields| fields.remove("color"));
        match color {
            Some(color) => {
                println!("✓ Color detected: {}", color);
                ctx.telemetry.color = Some(color);
                Ok(CheckVerdict::pass())
            }
            None => Ok(fail("Color line carried no color name")),
        }
    }
}

pub struct BatteryCheck;

#[async_trait]
impl Check for BatteryCheck {
    fn name(&self) -> &'static str {
        "battery"
    }

    fn title(&self) -> &'static str {
        "Battery Detection Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        let patterns = ctx.patterns;
        let battery = ctx.wait(&patterns.battery_level, ctx.timeouts.battery).await;
        let Some(line) = battery.matched() else {
            return Ok(fail("Battery not detected"));
        };

        let Some(level) = extract_percentage(&line.text, &patterns.battery_level, "battery") else {
            return Ok(fail(format!("Battery level unreadable: {}", line.text)));
        };

        println!("✓ Battery detected: {}%", level);
        ctx.telemetry.battery = Some(level);

        if level < LOW_BATTERY_PERCENT {
            println!("⚠️  WARNING: Low battery detected");
            ctx.advisories.push(format!("Low battery: {}%", level));
        }

        Ok(CheckVerdict::pass())
    }
}

pub struct RollCheck;

#[async_trait]
impl Check for RollCheck {
    fn name(&self) -> &'static str {
        "roll"
    }

    fn title(&self) -> &'static str {
        "Roll Detection Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        println!("📣 PLEASE ROLL THE DIE NOW");
        println!("⏳ Waiting for roll ({} seconds)...", ctx.timeouts.rolling);

        let patterns = ctx.patterns;
        if ctx.wait(&patterns.rolling, ctx.timeouts.rolling).await.matched().is_none() {
            return Ok(fail("Rolling state not detected"));
        }
        println!("✓ Rolling state detected");

        let stable = ctx.wait(&patterns.roll_stable, ctx.timeouts.stable).await;
        let Some(stable) = stable.matched() else {
            return Ok(fail("Stable state not detected"));
        };

        let Some(value) = extract_int(&stable.text, &patterns.roll_stable, "roll") else {
            return Ok(fail(format!("Roll value unreadable: {}", stable.text)));
        };

        println!("✓ Stable state detected - Roll value: {}", value);
        ctx.telemetry.roll_value = Some(value);

        if (1..=6).contains(&value) {
            Ok(pass("Roll value in valid range (1-6)"))
        } else {
            Ok(fail(format!("Roll value out of range: {}", value)))
        }
    }
}

pub struct IndicatorCheck;

#[async_trait]
impl Check for IndicatorCheck {
    fn name(&self) -> &'static str {
        "led"
    }

    fn title(&self) -> &'static str {
        "LED Control Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        let settle = Duration::from_millis(ctx.timeouts.indicator_settle_ms);
        let hold = Duration::from_millis(ctx.timeouts.indicator_hold_ms);

        println!("📣 Sending LED ON command...");
        ctx.source.send_byte(LED_ON).await.context("Failed to send LED ON command")?;
        sleep(settle).await;
        println!("✓ LED command sent");
        println!("❓ Do the dice LEDs turn RED? (visual check)");

        sleep(hold).await;

        println!("📣 Sending LED OFF command...");
        ctx.source.send_byte(LED_OFF).await.context("Failed to send LED OFF command")?;
        sleep(settle).await;
        println!("✓ LED OFF command sent");
        println!("❓ Did the LEDs turn off? (visual check)");

        Ok(CheckVerdict::manual("LEDs must be confirmed by eye"))
    }
}

pub struct StabilityCheck;

#[async_trait]
impl Check for StabilityCheck {
    fn name(&self) -> &'static str {
        "stability"
    }

    fn title(&self) -> &'static str {
        "Connection Stability Test"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckVerdict> {
        let window = ctx.timeouts.stability_window;
        println!("⏳ Monitoring connection for {} seconds...", window);

        let patterns = ctx.patterns;
        let mut disconnects = 0usize;
        let quiet = ctx.waiter.clone().with_echo(false);
        quiet
            .observe(ctx.source, Duration::from_secs(window), |line| {
                if patterns.disconnect.is_match(&line.text) {
                    disconnects += 1;
                    println!("⚠️  Disconnect detected (count: {})", disconnects);
                }
                if patterns.status.is_match(&line.text) {
                    println!("  Status: {}", line.text);
                }
            })
            .await;

        if disconnects == 0 {
            Ok(pass(&format!("No disconnections during {} second test", window)))
        } else {
            Ok(fail(format!("{} disconnection(s) detected", disconnects)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use crate::types::CheckStatus;

    struct Bench {
        waiter: PatternWaiter,
        patterns: PatternSet,
        timeouts: CheckTimeouts,
        telemetry: TelemetryRecord,
        advisories: Vec<String>,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                waiter: PatternWaiter::new(Duration::from_millis(20)).with_echo(false),
                patterns: PatternSet::defaults().unwrap(),
                timeouts: CheckTimeouts::default(),
                telemetry: TelemetryRecord::default(),
                advisories: Vec::new(),
            }
        }

        async fn run(
            &mut self,
            check: &dyn Check,
            source: &mut ScriptedSource,
        ) -> Result<CheckVerdict> {
            let mut ctx = CheckContext {
                source,
                waiter: &self.waiter,
                patterns: &self.patterns,
                timeouts: &self.timeouts,
                telemetry: &mut self.telemetry,
                advisories: &mut self.advisories,
            };
            check.run(&mut ctx).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn roll_in_range_passes() {
        let mut bench = Bench::new();
        let mut source =
            ScriptedSource::new(&["Rolling...", "DICE STABLE | Slot 0 | Roll Value: 4"]);

        let verdict = bench.run(&RollCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Pass);
        assert_eq!(bench.telemetry.roll_value, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn roll_out_of_range_fails_with_value() {
        let mut bench = Bench::new();
        let mut source =
            ScriptedSource::new(&["Rolling...", "DICE STABLE | Slot 0 | Roll Value: 9"]);

        let verdict = bench.run(&RollCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Fail);
        assert!(verdict.detail.unwrap().contains('9'));
        assert_eq!(bench.telemetry.roll_value, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn roll_without_stable_line_fails() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&["Rolling...", "Rolling..."]);

        let verdict = bench.run(&RollCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Fail);
        assert_eq!(bench.telemetry.roll_value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_stability_window_passes() {
        let mut bench = Bench::new();
        let mut source =
            ScriptedSource::new(&["Connected Dice: 1", "heartbeat", "Connected Dice: 1"]);

        let verdict = bench.run(&StabilityCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Pass);
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_disconnect_fails_stability() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&[
            "Connected Dice: 1",
            "DICE DISCONNECTED - Slot 0",
            "DICE CONNECTED - Slot 0",
        ]);

        let verdict = bench.run(&StabilityCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Fail);
        assert!(verdict.detail.unwrap().starts_with("1 disconnection"));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_records_mac() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&[
            "Found GoDice: GoDice_7F [E4:5F:01:AB:9C:10]",
            "Connecting...",
            "DICE CONNECTED - Slot 0",
        ]);

        let verdict = bench.run(&ConnectionCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Pass);
        assert_eq!(bench.telemetry.mac.as_deref(), Some("E4:5F:01:AB:9C:10"));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_without_confirmation_fails() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&["Found GoDice: GoDice_7F [E4:5F:01:AB:9C:10]"]);

        let verdict = bench.run(&ConnectionCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Fail);
        assert!(bench.telemetry.mac.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_passes_with_advisory() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&["BATTERY LEVEL | Slot 0 | Level: 12%"]);

        let verdict = bench.run(&BatteryCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Pass);
        assert_eq!(bench.telemetry.battery, Some(12));
        assert_eq!(bench.advisories, ["Low battery: 12%"]);
    }

    #[tokio::test(start_paused = true)]
    async fn color_is_captured() {
        let mut bench = Bench::new();
        let mut source =
            ScriptedSource::new(&["DICE COLOR DETECTED | Slot 0 | Shell Color: Green"]);

        let verdict = bench.run(&ColorCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Pass);
        assert_eq!(bench.telemetry.color.as_deref(), Some("Green"));
    }

    #[tokio::test(start_paused = true)]
    async fn indicator_sends_on_then_off_and_asks_operator() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&[]);

        let verdict = bench.run(&IndicatorCheck, &mut source).await.unwrap();
        assert_eq!(verdict.status, CheckStatus::Manual);
        assert_eq!(source.sent, [LED_ON, LED_OFF]);
    }

    #[tokio::test(start_paused = true)]
    async fn indicator_write_failure_is_an_error() {
        let mut bench = Bench::new();
        let mut source = ScriptedSource::new(&[]).failing_writes();

        let err = bench.run(&IndicatorCheck, &mut source).await.unwrap_err();
        assert!(format!("{:#}", err).contains("LED ON"));
    }
}
