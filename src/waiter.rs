use crate::line_source::LineStream;
use crate::patterns::Pattern;
use crate::types::Line;
use log::{debug, trace};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Matched { line: Line, elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl WaitOutcome {
    pub fn matched(self) -> Option<Line> {
        match self {
            WaitOutcome::Matched { line, .. } => Some(line),
            WaitOutcome::TimedOut { .. } => None,
        }
    }
}

/// Consumes lines at a fixed cadence until a pattern matches or time runs out.
///
/// Each poll takes exactly one interval, even when a line is already
/// buffered, so a match on the k-th line is reported after k intervals.
#[derive(Debug, Clone)]
pub struct PatternWaiter {
    poll_interval: Duration,
    echo: bool,
}

impl PatternWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            echo: true,
        }
    }

    /// Print every consumed line to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub async fn wait_for(
        &self,
        source: &mut dyn LineStream,
        pattern: &Pattern,
        timeout: Duration,
    ) -> WaitOutcome {
        let start = Instant::now();
        let deadline = start + timeout;
        debug!("Waiting up to {:?} for {} ({})", timeout, pattern.intent(), pattern.as_str());

        loop {
            let tick = Instant::now();
            if tick >= deadline {
                debug!("Timed out waiting for {}", pattern.intent());
                return WaitOutcome::TimedOut { elapsed: start.elapsed() };
            }

            let Some(line) = self.poll(source, tick).await else {
                continue;
            };

            if pattern.is_match(&line.text) {
                let elapsed = start.elapsed();
                debug!("Matched {} after {:?}", pattern.intent(), elapsed);
                return WaitOutcome::Matched { line, elapsed };
            }
        }
    }

    /// Passively consumes lines for the whole `window`, handing each one to
    /// `on_line`. Returns how many lines were seen.
    pub async fn observe<F>(
        &self,
        source: &mut dyn LineStream,
        window: Duration,
        mut on_line: F,
    ) -> usize
    where
        F: FnMut(&Line),
    {
        let deadline = Instant::now() + window;
        let mut seen = 0;

        loop {
            let tick = Instant::now();
            if tick >= deadline {
                return seen;
            }

            if let Some(line) = self.poll(source, tick).await {
                seen += 1;
                on_line(&line);
            }
        }
    }

    /// One paced poll: fetch at most one line, then hold until the interval
    /// that started at `tick` is over. Blank lines count as no line.
    async fn poll(&self, source: &mut dyn LineStream, tick: Instant) -> Option<Line> {
        let line = source.next_line(self.poll_interval).await;
        sleep_until(tick + self.poll_interval).await;

        let line = line.filter(|l| !l.text.trim().is_empty())?;
        trace!("Consumed line [{}]: {}", line.received_at.format("%H:%M:%S%.3f"), line.text);
        if self.echo {
            println!("  {}", line.text);
        }
        Some(line)
    }
}
