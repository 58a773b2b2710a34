//! In-memory `LineStream` for driving waiters and checks in tests.

use crate::error::HarnessError;
use crate::line_source::LineStream;
use crate::types::Line;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;

/// Replays a fixed script, one line per poll, and records written bytes.
pub struct ScriptedSource {
    lines: VecDeque<String>,
    pub sent: Vec<u8>,
    fail_writes: bool,
}

impl ScriptedSource {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            sent: Vec::new(),
            fail_writes: false,
        }
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.lines.len()
    }
}

#[async_trait]
impl LineStream for ScriptedSource {
    async fn next_line(&mut self, _wait: Duration) -> Option<Line> {
        self.lines.pop_front().map(Line::new)
    }

    async fn send_byte(&mut self, byte: u8) -> Result<(), HarnessError> {
        if self.fail_writes {
            return Err(HarnessError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device went away",
            )));
        }
        self.sent.push(byte);
        Ok(())
    }
}
