use crate::checks::{Check, CheckContext};
use crate::config::HarnessConfig;
use crate::line_source::{Connector, LineSource, LineStream};
use crate::patterns::PatternSet;
use crate::report::RunReport;
use crate::types::{CheckOutcome, CheckVerdict, TelemetryRecord};
use crate::waiter::PatternWaiter;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::time::sleep;

const BANNER_RULE: &str = "======================================================================";
const SECTION_RULE: &str = "============================================================";

tokio::task_local! {
    /// Name of the check currently running under [`run_guarded`].
    static GUARDED_CHECK: &'static str;
}

/// Routes panics raised inside a guarded check to the log instead of
/// stderr. Any other panic still goes to the previous hook.
pub fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| match guarded_check() {
        Some(name) => debug!("Check {} panicked: {}", name, info),
        None => previous(info),
    }));
}

fn guarded_check() -> Option<&'static str> {
    GUARDED_CHECK.try_with(|name| *name).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Connecting,
    Running(usize),
    Done,
}

/// Drives the checks one after another against a single line source.
///
/// A failing check never stops the sequence, and every configured check
/// yields exactly one outcome.
pub struct CheckRunner {
    checks: Vec<Box<dyn Check>>,
    config: HarnessConfig,
    patterns: PatternSet,
    waiter: PatternWaiter,
    state: RunnerState,
}

impl CheckRunner {
    pub fn new(checks: Vec<Box<dyn Check>>, config: HarnessConfig, patterns: PatternSet) -> Self {
        let waiter = PatternWaiter::new(config.poll_interval()).with_echo(config.echo);
        Self {
            checks,
            config,
            patterns,
            waiter,
            state: RunnerState::NotStarted,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    fn transition(&mut self, next: RunnerState) {
        debug!("Runner state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Connects through `connector` and runs every check. Always returns a
    /// report; if the port cannot be opened every check is marked FAIL.
    pub async fn run<C: Connector>(&mut self, connector: C) -> RunReport {
        let started_at = Utc::now();
        println!("\n{}", BANNER_RULE);
        println!("{}GoDice ESP32 Automated Test Suite", " ".repeat(10));
        println!("{}", BANNER_RULE);

        self.transition(RunnerState::Connecting);
        let target = connector.describe();
        let opened = LineSource::open_with_retry(
            connector,
            self.config.reconnect_backoff(),
            self.config.connect_attempts,
        )
        .await;

        let mut source = match opened {
            Ok(source) => source,
            Err(e) => {
                error!("Cannot connect to {}: {}", target, e);
                println!("✗ Failed to connect: {}", e);
                println!("❌ Cannot connect to ESP32. Skipping all tests.");
                return self.abandon(started_at, &e.to_string());
            }
        };

        println!("✓ Connected to {}", target);
        sleep(self.config.settle_delay()).await;

        self.run_checks(&mut source, started_at).await
    }

    fn abandon(&mut self, started_at: DateTime<Utc>, reason: &str) -> RunReport {
        let outcomes = self
            .checks
            .iter()
            .map(|check| {
                CheckOutcome::new(check.name(), CheckVerdict::fail(format!("not run: {}", reason)))
            })
            .collect();
        self.transition(RunnerState::Done);
        RunReport::build(
            started_at,
            self.config.usb_port.clone(),
            outcomes,
            TelemetryRecord::default(),
            Vec::new(),
        )
    }

    /// Runs every check against an already open source.
    pub async fn run_checks(
        &mut self,
        source: &mut dyn LineStream,
        started_at: DateTime<Utc>,
    ) -> RunReport {
        let mut telemetry = TelemetryRecord::default();
        let mut advisories = Vec::new();
        let mut outcomes = Vec::with_capacity(self.checks.len());

        for index in 0..self.checks.len() {
            self.transition(RunnerState::Running(index));

            let check = self.checks[index].as_ref();
            println!("\n{}", SECTION_RULE);
            println!("TEST {}: {}", index + 1, check.title());
            println!("{}", SECTION_RULE);

            let verdict = {
                let mut ctx = CheckContext {
                    source: &mut *source,
                    waiter: &self.waiter,
                    patterns: &self.patterns,
                    timeouts: &self.config.timeouts,
                    telemetry: &mut telemetry,
                    advisories: &mut advisories,
                };
                run_guarded(check, &mut ctx).await
            };

            info!("Check {} finished: {}", check.name(), verdict.status);
            outcomes.push(CheckOutcome::new(check.name(), verdict));

            sleep(self.config.inter_check_pause()).await;
        }

        self.transition(RunnerState::Done);
        RunReport::build(started_at, self.config.usb_port.clone(), outcomes, telemetry, advisories)
    }
}

/// Runs one check, turning an `Err` or a panic into an ERROR verdict.
async fn run_guarded(check: &dyn Check, ctx: &mut CheckContext<'_>) -> CheckVerdict {
    let run = AssertUnwindSafe(check.run(ctx)).catch_unwind();
    let guarded = GUARDED_CHECK.scope(check.name(), run);
    match guarded.await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            warn!("Check {} errored: {:#}", check.name(), e);
            println!("❌ Test error: {:#}", e);
            CheckVerdict::error(format!("{:#}", e))
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!("Check {} panicked: {}", check.name(), message);
            println!("❌ Test error: {}", message);
            CheckVerdict::error(message)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "check panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::default_checks;
    use crate::error::ConnectError;
    use crate::report::Verdict;
    use crate::testing::ScriptedSource;
    use crate::types::CheckStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    struct FixedCheck(&'static str, CheckStatus);

    #[async_trait]
    impl Check for FixedCheck {
        fn name(&self) -> &'static str {
            self.0
        }

        fn title(&self) -> &'static str {
            "Fixed"
        }

        async fn run(&self, _ctx: &mut CheckContext<'_>) -> anyhow::Result<CheckVerdict> {
            Ok(CheckVerdict {
                status: self.1,
                detail: None,
            })
        }
    }

    struct BrokenCheck;

    #[async_trait]
    impl Check for BrokenCheck {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn title(&self) -> &'static str {
            "Broken"
        }

        async fn run(&self, _ctx: &mut CheckContext<'_>) -> anyhow::Result<CheckVerdict> {
            anyhow::bail!("firmware answered with garbage")
        }
    }

    struct PanickingCheck;

    #[async_trait]
    impl Check for PanickingCheck {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn title(&self) -> &'static str {
            "Panicky"
        }

        async fn run(&self, _ctx: &mut CheckContext<'_>) -> anyhow::Result<CheckVerdict> {
            panic!("index out of range")
        }
    }

    /// Fails `failures` times with the given error kind, then hands out a stream.
    struct FlakyConnector {
        attempts: AtomicUsize,
        failures: usize,
        transient: bool,
        stream: Mutex<Option<DuplexStream>>,
    }

    impl FlakyConnector {
        fn new(failures: usize, transient: bool) -> (Self, DuplexStream) {
            let (device, host) = duplex(256);
            let connector = Self {
                attempts: AtomicUsize::new(0),
                failures,
                transient,
                stream: Mutex::new(Some(host)),
            };
            (connector, device)
        }
    }

    #[async_trait]
    impl Connector for std::sync::Arc<FlakyConnector> {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream, ConnectError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(if self.transient {
                    ConnectError::Busy("port in use".to_string())
                } else {
                    ConnectError::Unavailable("no such port".to_string())
                });
            }
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ConnectError::Unavailable("already taken".to_string()))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn quick_config() -> HarnessConfig {
        HarnessConfig {
            usb_port: "COM3".to_string(),
            settle_secs: 0,
            inter_check_pause_ms: 0,
            reconnect_backoff_secs: 0,
            echo: false,
            ..HarnessConfig::default()
        }
    }

    fn runner(checks: Vec<Box<dyn Check>>) -> CheckRunner {
        CheckRunner::new(checks, quick_config(), PatternSet::defaults().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn every_check_reports_once_in_order_despite_faults() {
        let mut runner = runner(vec![
            Box::new(FixedCheck("first", CheckStatus::Fail)),
            Box::new(BrokenCheck),
            Box::new(PanickingCheck),
            Box::new(FixedCheck("last", CheckStatus::Pass)),
        ]);
        let mut source = ScriptedSource::new(&[]);

        let report = runner.run_checks(&mut source, Utc::now()).await;

        let names: Vec<_> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["first", "broken", "panicky", "last"]);
        let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            [CheckStatus::Fail, CheckStatus::Error, CheckStatus::Error, CheckStatus::Pass]
        );
        assert!(report.outcomes[1].detail.as_deref().unwrap().contains("garbage"));
        assert_eq!(report.outcomes[2].detail.as_deref(), Some("index out of range"));
        assert_eq!(runner.state(), RunnerState::Done);
    }

    #[tokio::test]
    async fn panics_are_only_quiet_inside_a_guarded_check() {
        assert_eq!(guarded_check(), None);
        let inside = GUARDED_CHECK.scope("led", async { guarded_check() }).await;
        assert_eq!(inside, Some("led"));
        assert_eq!(guarded_check(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_port_fails_every_check() {
        let (connector, _device) = FlakyConnector::new(usize::MAX, false);
        let connector = std::sync::Arc::new(connector);
        let mut runner = runner(default_checks());

        let report = runner.run(connector.clone()).await;

        assert_eq!(report.outcomes.len(), 8);
        assert!(report.outcomes.iter().all(|o| o.status == CheckStatus::Fail));
        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(runner.state(), RunnerState::Done);
    }

    #[tokio::test]
    async fn busy_port_is_retried_before_running() {
        let (connector, _device) = FlakyConnector::new(2, true);
        let connector = std::sync::Arc::new(connector);
        let mut runner = runner(vec![Box::new(FixedCheck("only", CheckStatus::Pass))]);

        let report = runner.run(connector.clone()).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, CheckStatus::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_device_transcript_passes() {
        let mut runner = runner(default_checks());
        let mut source = ScriptedSource::new(&[
            "=== GoDice ESP32 Integration Test ===",
            "Starting scan for GoDice devices...",
            "Found GoDice: GoDice_7F [E4:5F:01:AB:9C:10]",
            "DICE CONNECTED - Slot 0",
            "DICE COLOR DETECTED | Slot 0 | Shell Color: Red",
            "BATTERY LEVEL | Slot 0 | Level: 87%",
            "Rolling...",
            "DICE STABLE | Slot 0 | Roll Value: 4",
            "Connected Dice: 1",
        ]);

        let report = runner.run_checks(&mut source, Utc::now()).await;

        let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            [
                CheckStatus::Pass,
                CheckStatus::Pass,
                CheckStatus::Pass,
                CheckStatus::Pass,
                CheckStatus::Pass,
                CheckStatus::Pass,
                CheckStatus::Manual,
                CheckStatus::Pass,
            ]
        );
        assert_eq!(source.sent, [b'l', b'o']);
        assert_eq!(report.telemetry.color.as_deref(), Some("Red"));
        assert_eq!(report.telemetry.battery, Some(87));
        assert_eq!(report.telemetry.roll_value, Some(4));
        assert!(report.advisories.is_empty());
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_fails_but_still_reaches_done() {
        let mut runner = runner(default_checks());
        let mut source = ScriptedSource::new(&[]);

        let report = runner.run_checks(&mut source, Utc::now()).await;

        assert_eq!(report.outcomes.len(), 8);
        assert_eq!(report.counts.failed, 6);
        assert_eq!(report.counts.manual, 1);
        assert_eq!(report.counts.passed, 1);
        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(runner.state(), RunnerState::Done);
    }
}
