use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// A single decoded line of device output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub received_at: DateTime<Utc>,
    pub text: String,
}

impl Line {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            received_at: Utc::now(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Needs an operator to confirm the result by eye.
    Manual,
    /// The check itself broke before it could decide.
    Error,
}

impl CheckStatus {
    pub fn symbol(self) -> &'static str {
        match self {
            CheckStatus::Pass => "✓",
            CheckStatus::Fail => "✗",
            CheckStatus::Manual | CheckStatus::Error => "❓",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Manual => "MANUAL",
            CheckStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// What a check body decided, before the runner tags it with a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckVerdict {
    pub status: CheckStatus,
    pub detail: Option<String>,
}

impl CheckVerdict {
    pub fn pass() -> Self {
        Self {
            status: CheckStatus::Pass,
            detail: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            detail: Some(detail.into()),
        }
    }

    pub fn manual(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Manual,
            detail: Some(detail.into()),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn new(name: impl Into<String>, verdict: CheckVerdict) -> Self {
        Self {
            name: name.into(),
            status: verdict.status,
            detail: verdict.detail,
        }
    }
}

/// Values pulled out of device output over the course of a run.
///
/// Fields are only ever filled in; nothing clears them mid-run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll_value: Option<i64>,
}

impl TelemetryRecord {
    pub fn is_empty(&self) -> bool {
        self.mac.is_none()
            && self.color.is_none()
            && self.battery.is_none()
            && self.roll_value.is_none()
    }
}
