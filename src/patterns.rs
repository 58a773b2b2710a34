use crate::error::HarnessError;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

/// A compiled matching rule for one line of device output, tagged with what
/// it is meant to recognise.
#[derive(Clone)]
pub struct Pattern {
    intent: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(intent: impl Into<String>, expr: &str) -> Result<Self, HarnessError> {
        let intent = intent.into();
        let regex = Regex::new(expr).map_err(|source| HarnessError::Pattern {
            name: intent.clone(),
            source,
        })?;
        Ok(Self { intent, regex })
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Substring search; the pattern may match anywhere in the line.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub(crate) fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("intent", &self.intent)
            .field("regex", &self.regex.as_str())
            .finish()
    }
}

pub const BOOT_BANNER: &str = "boot_banner";
pub const SCAN_START: &str = "scan_start";
pub const DICE_FOUND: &str = "dice_found";
pub const MAC_ADDRESS: &str = "mac_address";
pub const DICE_CONNECTED: &str = "dice_connected";
pub const SHELL_COLOR: &str = "shell_color";
pub const BATTERY_LEVEL: &str = "battery_level";
pub const ROLLING: &str = "rolling";
pub const ROLL_STABLE: &str = "roll_stable";
pub const DISCONNECT: &str = "disconnect";
pub const STATUS: &str = "status";

const DEFAULTS: &[(&str, &str)] = &[
    (BOOT_BANNER, r"GoDice ESP32 Integration Test"),
    (SCAN_START, r"Starting scan for GoDice"),
    (DICE_FOUND, r"Found GoDice"),
    (MAC_ADDRESS, r"(?i)(?P<mac>[0-9A-F]{2}(?::[0-9A-F]{2}){5})"),
    (DICE_CONNECTED, r"DICE CONNECTED - Slot"),
    (SHELL_COLOR, r"DICE COLOR DETECTED.*Shell Color: (?P<color>\w+)"),
    (BATTERY_LEVEL, r"BATTERY LEVEL.*Level: (?P<battery>\d+)%"),
    (ROLLING, r"Rolling\.\.\."),
    (ROLL_STABLE, r"DICE STABLE.*Roll Value: (?P<roll>\d+)"),
    (DISCONNECT, r"DISCONNECTED"),
    (STATUS, r"Connected Dice:"),
];

/// Every pattern the checks match device output against.
#[derive(Debug, Clone)]
pub struct PatternSet {
    pub boot_banner: Pattern,
    pub scan_start: Pattern,
    pub dice_found: Pattern,
    pub mac_address: Pattern,
    pub dice_connected: Pattern,
    pub shell_color: Pattern,
    pub battery_level: Pattern,
    pub rolling: Pattern,
    pub roll_stable: Pattern,
    pub disconnect: Pattern,
    pub status: Pattern,
}

impl PatternSet {
    /// Builds the set from the built-in expressions, replacing any named in
    /// `overrides`. Unknown names are rejected so typos do not go unnoticed.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self, HarnessError> {
        let known = |k: &&String| DEFAULTS.iter().any(|(name, _)| *name == k.as_str());
        if let Some(unknown) = overrides.keys().find(|k| !known(k)) {
            return Err(HarnessError::Config(format!("unknown pattern name '{}'", unknown)));
        }

        let build = |name: &str| -> Result<Pattern, HarnessError> {
            let expr = match overrides.get(name) {
                Some(expr) => expr.as_str(),
                None => DEFAULTS
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, expr)| *expr)
                    .ok_or_else(|| {
                        HarnessError::Config(format!("no default for pattern '{}'", name))
                    })?,
            };
            Pattern::new(name, expr)
        };

        Ok(Self {
            boot_banner: build(BOOT_BANNER)?,
            scan_start: build(SCAN_START)?,
            dice_found: build(DICE_FOUND)?,
            mac_address: build(MAC_ADDRESS)?,
            dice_connected: build(DICE_CONNECTED)?,
            shell_color: build(SHELL_COLOR)?,
            battery_level: build(BATTERY_LEVEL)?,
            rolling: build(ROLLING)?,
            roll_stable: build(ROLL_STABLE)?,
            disconnect: build(DISCONNECT)?,
            status: build(STATUS)?,
        })
    }

    pub fn defaults() -> Result<Self, HarnessError> {
        Self::with_overrides(&HashMap::new())
    }
}
