use crate::types::{CheckOutcome, CheckStatus, TelemetryRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

const RULE: &str = "============================================================";
const THIN_RULE: &str = "----------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Partial,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub passed: usize,
    pub failed: usize,
    pub manual: usize,
    pub errors: usize,
}

impl Counts {
    pub fn tally(outcomes: &[CheckOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut counts, outcome| {
            match outcome.status {
                CheckStatus::Pass => counts.passed += 1,
                CheckStatus::Fail => counts.failed += 1,
                CheckStatus::Manual => counts.manual += 1,
                CheckStatus::Error => counts.errors += 1,
            }
            counts
        })
    }

    /// PASS needs no failures and more than five passes; up to two failures
    /// is PARTIAL; anything else is FAIL.
    pub fn verdict(&self) -> Verdict {
        if self.failed == 0 && self.passed > 5 {
            Verdict::Pass
        } else if self.failed <= 2 {
            Verdict::Partial
        } else {
            Verdict::Fail
        }
    }
}

/// Final summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub port: String,
    pub outcomes: Vec<CheckOutcome>,
    pub telemetry: TelemetryRecord,
    pub advisories: Vec<String>,
    pub counts: Counts,
    pub verdict: Verdict,
}

impl RunReport {
    pub fn build(
        started_at: DateTime<Utc>,
        port: impl Into<String>,
        outcomes: Vec<CheckOutcome>,
        telemetry: TelemetryRecord,
        advisories: Vec<String>,
    ) -> Self {
        let counts = Counts::tally(&outcomes);
        Self {
            started_at,
            port: port.into(),
            verdict: counts.verdict(),
            outcomes,
            telemetry,
            advisories,
            counts,
        }
    }

    /// True when no check failed. MANUAL and ERROR outcomes do not count
    /// against the run here, whatever the verdict says.
    pub fn succeeded(&self) -> bool {
        self.counts.failed == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "TEST SUMMARY REPORT")?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Test Date: {}", self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Serial Port: {}", self.port)?;
        writeln!(f)?;

        if !self.telemetry.is_empty() {
            writeln!(f, "Dice Information:")?;
            writeln!(f, "{}", THIN_RULE)?;
            if let Some(ref mac) = self.telemetry.mac {
                writeln!(f, "  MAC Address: {}", mac)?;
            }
            if let Some(ref color) = self.telemetry.color {
                writeln!(f, "  Shell Color: {}", color)?;
            }
            if let Some(battery) = self.telemetry.battery {
                writeln!(f, "  Battery Level: {}%", battery)?;
            }
            if let Some(roll) = self.telemetry.roll_value {
                writeln!(f, "  Last Roll: {}", roll)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Test Results:")?;
        writeln!(f, "{}", THIN_RULE)?;
        for outcome in &self.outcomes {
            write!(
                f,
                "  {} {}: {}",
                outcome.status.symbol(),
                outcome.name.to_uppercase(),
                outcome.status
            )?;
            match outcome.detail {
                Some(ref detail) => writeln!(f, " ({})", detail)?,
                None => writeln!(f)?,
            }
        }
        writeln!(f)?;

        writeln!(f, "Total Tests: {}", self.outcomes.len())?;
        writeln!(f, "  Passed: {}", self.counts.passed)?;
        writeln!(f, "  Failed: {}", self.counts.failed)?;
        writeln!(f, "  Manual: {}", self.counts.manual)?;
        if self.counts.errors > 0 {
            writeln!(f, "  Errors: {}", self.counts.errors)?;
        }
        writeln!(f)?;

        for advisory in &self.advisories {
            writeln!(f, "⚠️  {}", advisory)?;
        }
        if !self.advisories.is_empty() {
            writeln!(f)?;
        }

        match self.verdict {
            Verdict::Pass => {
                writeln!(f, "🎉 OVERALL STATUS: ✓ PASS - Library is working correctly!")?
            }
            Verdict::Partial => {
                writeln!(f, "⚠️  OVERALL STATUS: PARTIAL PASS - Some issues found")?
            }
            Verdict::Fail => writeln!(f, "❌ OVERALL STATUS: FAIL - Major issues detected")?,
        }
        writeln!(f, "{}", RULE)
    }
}
