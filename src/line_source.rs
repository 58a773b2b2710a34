use crate::error::{ConnectError, HarnessError};
use crate::types::Line;
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_serial::SerialPortBuilderExt;

const LINE_QUEUE_CAPACITY: usize = 1024;
const COMMAND_QUEUE_CAPACITY: usize = 8;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// An ordered stream of device lines that also accepts single-byte commands.
#[async_trait]
pub trait LineStream: Send {
    /// Next buffered line, waiting at most `wait` for one to arrive.
    async fn next_line(&mut self, wait: Duration) -> Option<Line>;

    async fn send_byte(&mut self, byte: u8) -> Result<(), HarnessError>;
}

/// Opens the byte transport underneath a [`LineSource`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Stream, ConnectError>;

    fn describe(&self) -> String;
}

pub struct SerialConnector {
    port_path: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(port_path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate,
            read_timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Stream = tokio_serial::SerialStream;

    async fn connect(&self) -> Result<Self::Stream, ConnectError> {
        let port = tokio_serial::new(&self.port_path, self.baud_rate)
            .timeout(self.read_timeout)
            .open_native_async()?;
        Ok(port)
    }

    fn describe(&self) -> String {
        format!("{} at {} baud", self.port_path, self.baud_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
}

struct WriteRequest {
    byte: u8,
    reply: oneshot::Sender<Result<(), HarnessError>>,
}

enum PumpEnd {
    Eof,
    ConsumerGone,
}

enum PumpEvent {
    Read(usize),
    Command(Option<WriteRequest>),
}

/// Line reader over a reconnecting transport.
///
/// A background task owns the transport. Lines are handed over through a
/// bounded queue; lines that arrive while the link is down are lost.
pub struct LineSource {
    lines: mpsc::Receiver<Line>,
    commands: mpsc::Sender<WriteRequest>,
    state: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl LineSource {
    /// Opens the transport. A transient failure is retried after `backoff`,
    /// for at most `attempts` tries in total. Once open, disconnects are
    /// retried every `backoff` until the source is dropped.
    pub async fn open_with_retry<C: Connector>(
        connector: C,
        backoff: Duration,
        attempts: u32,
    ) -> Result<Self, ConnectError> {
        let mut attempt = 1;
        let stream = loop {
            match connector.connect().await {
                Ok(stream) => break stream,
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        connector.describe(),
                        attempt,
                        attempts,
                        e,
                        backoff
                    );
                    attempt += 1;
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };
        info!("Connected to {}", connector.describe());

        let (line_tx, lines) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state) = watch::channel(LinkState::Connected);

        let manager = LinkManager {
            connector,
            backoff,
            line_tx,
            command_rx,
            state_tx,
        };
        let task = tokio::spawn(manager.run(stream));

        Ok(Self {
            lines,
            commands,
            state,
            task,
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }
}

impl Drop for LineSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl LineStream for LineSource {
    async fn next_line(&mut self, wait: Duration) -> Option<Line> {
        tokio::time::timeout(wait, self.lines.recv()).await.ok().flatten()
    }

    async fn send_byte(&mut self, byte: u8) -> Result<(), HarnessError> {
        if self.state() != LinkState::Connected {
            return Err(HarnessError::Disconnected);
        }

        let (reply, reply_rx) = oneshot::channel();
        let round_trip = async {
            if self.commands.send(WriteRequest { byte, reply }).await.is_err() {
                return Err(HarnessError::Closed);
            }
            reply_rx.await.unwrap_or(Err(HarnessError::Closed))
        };

        match timeout(WRITE_TIMEOUT, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::Write(write_timed_out())),
        }
    }
}

struct LinkManager<C: Connector> {
    connector: C,
    backoff: Duration,
    line_tx: mpsc::Sender<Line>,
    command_rx: mpsc::Receiver<WriteRequest>,
    state_tx: watch::Sender<LinkState>,
}

impl<C: Connector> LinkManager<C> {
    async fn run(mut self, first: C::Stream) {
        let mut stream = Some(first);

        loop {
            if let Some(connected) = stream.take() {
                let _ = self.state_tx.send(LinkState::Connected);

                match self.pump(connected).await {
                    Ok(PumpEnd::ConsumerGone) => {
                        debug!("Line consumer dropped, closing {}", self.connector.describe());
                        return;
                    }
                    Ok(PumpEnd::Eof) => warn!("Serial link closed by device"),
                    Err(e) => warn!("Serial link error: {}", e),
                }

                let _ = self.state_tx.send(LinkState::Reconnecting);
            }

            info!("Reconnecting in {:?}...", self.backoff);
            if !self.wait_backoff().await {
                return;
            }

            match self.connector.connect().await {
                Ok(reopened) => {
                    info!("Reconnected to {}", self.connector.describe());
                    stream = Some(reopened);
                }
                Err(e) => warn!("Reconnect to {} failed: {}", self.connector.describe(), e),
            }
        }
    }

    async fn pump(&mut self, stream: C::Stream) -> std::io::Result<PumpEnd> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();

        loop {
            let event = tokio::select! {
                result = reader.read_until(b'\n', &mut buffer) => PumpEvent::Read(result?),
                request = self.command_rx.recv() => PumpEvent::Command(request),
            };

            match event {
                PumpEvent::Read(0) => return Ok(PumpEnd::Eof),
                PumpEvent::Read(_) => {
                    let text = String::from_utf8_lossy(&buffer).trim().to_string();
                    buffer.clear();
                    if text.is_empty() {
                        continue;
                    }

                    trace!("Received line: {}", text);
                    if let Some(end) = self.deliver(Line::new(text), &mut writer).await {
                        return Ok(end);
                    }
                }
                PumpEvent::Command(Some(request)) => serve_write(&mut writer, request).await,
                PumpEvent::Command(None) => return Ok(PumpEnd::ConsumerGone),
            }
        }
    }

    /// Queues one line. While the queue is full, reading stops but writes
    /// are still served.
    async fn deliver(
        &mut self,
        line: Line,
        writer: &mut WriteHalf<C::Stream>,
    ) -> Option<PumpEnd> {
        let line = match self.line_tx.try_send(line) {
            Ok(()) => return None,
            Err(TrySendError::Closed(_)) => return Some(PumpEnd::ConsumerGone),
            Err(TrySendError::Full(line)) => line,
        };
        debug!("Line queue full, pausing reads");

        loop {
            let event = tokio::select! {
                permit = self.line_tx.reserve() => Ok(permit),
                request = self.command_rx.recv() => Err(request),
            };

            match event {
                Ok(Ok(permit)) => {
                    permit.send(line);
                    return None;
                }
                Ok(Err(_)) | Err(None) => return Some(PumpEnd::ConsumerGone),
                Err(Some(request)) => serve_write(writer, request).await,
            }
        }
    }

    /// Sleeps out the backoff, rejecting writes meanwhile. Returns `false`
    /// once nobody is listening any more.
    async fn wait_backoff(&mut self) -> bool {
        let pause = sleep(self.backoff);
        tokio::pin!(pause);

        loop {
            tokio::select! {
                _ = &mut pause => return !self.line_tx.is_closed(),
                request = self.command_rx.recv() => match request {
                    Some(request) => {
                        let _ = request.reply.send(Err(HarnessError::Disconnected));
                    }
                    None => return false,
                },
            }
        }
    }
}

async fn serve_write<S: AsyncWrite>(writer: &mut WriteHalf<S>, request: WriteRequest) {
    debug!("Sending command byte {:?}", char::from(request.byte));
    let result = match timeout(WRITE_TIMEOUT, write_byte(writer, request.byte)).await {
        Ok(written) => written.map_err(HarnessError::Write),
        Err(_) => Err(HarnessError::Write(write_timed_out())),
    };
    let _ = request.reply.send(result);
}

async fn write_byte<S: AsyncWrite>(writer: &mut WriteHalf<S>, byte: u8) -> std::io::Result<()> {
    writer.write_all(&[byte]).await?;
    writer.flush().await
}

fn write_timed_out() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "serial write timed out")
}
