//! I/O bridge between a supervised process and the rest of the monitor.
//!
//! The supervisor never writes to or reads from the child directly. Each
//! time it spawns (or loses) a child it announces the new pipe handles, and
//! two long-lived relays pick them up:
//!
//! ```text
//!  Supervisor ──InputEvent (pipes and commands)──> input relay ──> child stdin
//!   │                                                 ^
//!   │  Supervisor::send_command ──────────────────────┘
//!   └─────────Pipe<stdout>──> output relay <── child stdout
//!                                  │ LogLineParser
//!                                  v
//!   input relay errors ──> log queue (16) ──> forwarder ──> LogSink
//! ```
//!
//! The relays outlive any single child, so command senders and log
//! consumers are unaffected by restarts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::logline::LogLineParser;
use super::models::LogRecord;

/// Capacity of the per-server log queue. Producers wait when it is full.
pub const LOG_QUEUE_CAPACITY: usize = 16;

/// Operator-facing text when a command arrives while no child is running.
pub const NOT_RUNNING_MESSAGE: &str = "Cannot send command, server is not running.";

/// The current pipe handle of a supervised child, if any.
#[derive(Debug)]
pub enum Pipe<T> {
    Idle,
    Active(T),
}

/// One item on a supervisor's input queue. Pipe swaps and commands share a
/// queue so they are applied in the order they were issued.
#[derive(Debug)]
pub enum InputEvent<W> {
    Pipe(Pipe<W>),
    Command(String),
}

/// Destination of every log record a supervisor produces.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn publish(&self, record: LogRecord);
}

/// Writes commands to the current input handle.
///
/// Events are served strictly in queue order: a command queued before an
/// `Idle` announcement still goes to the child that was current when it was
/// issued. Each event is handled to completion before the next one, so a
/// write in progress is never cut short by a handle swap. The relay stops
/// once every sender is gone.
pub async fn run_input_relay<W>(
    server_id: i64,
    mut events: mpsc::Receiver<InputEvent<W>>,
    log_tx: mpsc::Sender<LogRecord>,
) where
    W: AsyncWrite + Unpin,
{
    let mut pipe: Pipe<W> = Pipe::Idle;

    while let Some(event) = events.recv().await {
        match event {
            InputEvent::Pipe(next) => pipe = next,
            InputEvent::Command(command) => {
                let report = match &mut pipe {
                    Pipe::Active(writer) => match write_line(writer, &command).await {
                        Ok(()) => None,
                        Err(e) => {
                            warn!(server_id, error = %e, "Failed to write to server stdin");
                            Some(format!("Could not send command: {}", e))
                        }
                    },
                    Pipe::Idle => Some(NOT_RUNNING_MESSAGE.to_string()),
                };
                if let Some(message) = report
                    && log_tx.send(LogRecord::error(server_id, message)).await.is_err()
                {
                    break;
                }
            }
        }
    }
    debug!(server_id, "Input relay stopped");
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

enum OutputStep<R> {
    Announced(Option<Pipe<R>>),
    Read(std::io::Result<usize>),
}

/// Reads lines from the current output handle and turns them into records.
///
/// A newly announced handle replaces the current one immediately. An `Idle`
/// announcement lets the current handle drain to end-of-stream, so the last
/// words of a stopping server still reach operators.
pub async fn run_output_relay<R>(
    server_id: i64,
    mut pipes: mpsc::Receiver<Pipe<R>>,
    log_tx: mpsc::Sender<LogRecord>,
) where
    R: AsyncRead + Unpin,
{
    let mut parser = LogLineParser::new(server_id, Local::now());
    let mut current: Option<BufReader<R>> = None;
    let mut buf = Vec::new();
    let mut announcements_open = true;

    loop {
        let step = match current.as_mut() {
            None if !announcements_open => break,
            None => OutputStep::Announced(pipes.recv().await),
            Some(reader) => {
                tokio::select! {
                    next = pipes.recv(), if announcements_open => OutputStep::Announced(next),
                    read = reader.read_until(b'\n', &mut buf) => OutputStep::Read(read),
                }
            }
        };

        match step {
            OutputStep::Announced(None) => announcements_open = false,
            OutputStep::Announced(Some(Pipe::Idle)) => {}
            OutputStep::Announced(Some(Pipe::Active(reader))) => {
                buf.clear();
                current = Some(BufReader::new(reader));
            }
            OutputStep::Read(Ok(0)) => {
                if !buf.is_empty() && !forward_line(&mut parser, &buf, &log_tx).await {
                    break;
                }
                buf.clear();
                current = None;
            }
            OutputStep::Read(Ok(_)) => {
                if !forward_line(&mut parser, &buf, &log_tx).await {
                    break;
                }
                buf.clear();
            }
            OutputStep::Read(Err(e)) => {
                warn!(server_id, error = %e, "Failed to read server output");
                let record = LogRecord::error(server_id, format!("Error reading server output: {}", e));
                if log_tx.send(record).await.is_err() {
                    break;
                }
                buf.clear();
                current = None;
            }
        }
    }
    debug!(server_id, "Output relay stopped");
}

/// Parse and queue one raw line. Returns false once the queue is closed.
async fn forward_line(
    parser: &mut LogLineParser,
    raw: &[u8],
    log_tx: &mpsc::Sender<LogRecord>,
) -> bool {
    let line = String::from_utf8_lossy(raw);
    for record in parser.parse(&line, Local::now()) {
        if log_tx.send(record).await.is_err() {
            return false;
        }
    }
    true
}

/// Drains a supervisor's log queue into the sink until every producer is gone.
pub async fn run_forwarder(mut log_rx: mpsc::Receiver<LogRecord>, sink: Arc<dyn LogSink>) {
    while let Some(record) = log_rx.recv().await {
        sink.publish(record).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::monitor::models::{ERROR_CLASS, MONITOR_CLASS};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    /// Sink that records everything it is given.
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub records: Mutex<Vec<LogRecord>>,
    }

    impl CollectingSink {
        pub fn messages(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.message.clone())
                .collect()
        }

        /// Poll until a record with `message` shows up.
        pub async fn wait_for(&self, message: &str) -> bool {
            self.wait_until(|m| m == message).await
        }

        pub async fn wait_for_prefix(&self, prefix: &str) -> bool {
            self.wait_until(|m| m.starts_with(prefix)).await
        }

        async fn wait_until(&self, pred: impl Fn(&str) -> bool) -> bool {
            for _ in 0..400 {
                if self.messages().iter().any(|m| pred(m)) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            false
        }
    }

    #[async_trait]
    impl LogSink for CollectingSink {
        async fn publish(&self, record: LogRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    type Input = InputEvent<tokio::io::DuplexStream>;

    fn command(text: &str) -> Input {
        InputEvent::Command(text.to_string())
    }

    #[tokio::test]
    async fn test_input_relay_without_pipe_reports_not_running() {
        let (input_tx, input_rx) = mpsc::channel::<Input>(4);
        let (log_tx, mut log_rx) = mpsc::channel(4);
        tokio::spawn(run_input_relay(5, input_rx, log_tx));

        input_tx.send(command("/time")).await.unwrap();
        let record = log_rx.recv().await.unwrap();
        assert_eq!(record.server_id, 5);
        assert_eq!(record.class, ERROR_CLASS);
        assert_eq!(record.message, NOT_RUNNING_MESSAGE);
    }

    #[tokio::test]
    async fn test_input_relay_writes_newline_terminated_commands() {
        let (input_tx, input_rx) = mpsc::channel(4);
        let (log_tx, _log_rx) = mpsc::channel(4);
        let (writer, mut reader) = duplex(256);
        let relay = tokio::spawn(run_input_relay(1, input_rx, log_tx));

        input_tx.send(InputEvent::Pipe(Pipe::Active(writer))).await.unwrap();
        input_tx.send(command("/time set day")).await.unwrap();

        let mut line = vec![0u8; "/time set day\n".len()];
        reader.read_exact(&mut line).await.unwrap();
        assert_eq!(line, b"/time set day\n");

        drop(input_tx);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_input_relay_idle_after_active_rejects_commands() {
        let (input_tx, input_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(4);
        let (writer, _reader) = duplex(256);
        tokio::spawn(run_input_relay(2, input_rx, log_tx));

        input_tx.send(InputEvent::Pipe(Pipe::Active(writer))).await.unwrap();
        input_tx.send(InputEvent::Pipe(Pipe::Idle)).await.unwrap();
        input_tx.send(command("/stop")).await.unwrap();
        let record = log_rx.recv().await.unwrap();
        assert_eq!(record.message, NOT_RUNNING_MESSAGE);
    }

    #[tokio::test]
    async fn test_input_relay_delivers_command_queued_before_idle() {
        let (input_tx, input_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(4);
        let (writer, mut reader) = duplex(256);
        let relay = tokio::spawn(run_input_relay(2, input_rx, log_tx));

        input_tx.send(InputEvent::Pipe(Pipe::Active(writer))).await.unwrap();
        input_tx.send(command("/save")).await.unwrap();
        input_tx.send(InputEvent::Pipe(Pipe::Idle)).await.unwrap();
        drop(input_tx);
        relay.await.unwrap();

        let mut written = String::new();
        reader.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "/save\n");
        assert!(log_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_input_relay_new_pipe_receives_later_commands() {
        let (input_tx, input_rx) = mpsc::channel(8);
        let (log_tx, _log_rx) = mpsc::channel(4);
        let (old_writer, mut old_reader) = duplex(256);
        let (new_writer, mut new_reader) = duplex(256);
        let relay = tokio::spawn(run_input_relay(2, input_rx, log_tx));

        input_tx.send(InputEvent::Pipe(Pipe::Active(old_writer))).await.unwrap();
        input_tx.send(command("first")).await.unwrap();
        input_tx.send(InputEvent::Pipe(Pipe::Active(new_writer))).await.unwrap();
        input_tx.send(command("second")).await.unwrap();
        drop(input_tx);
        relay.await.unwrap();

        let mut old = String::new();
        old_reader.read_to_string(&mut old).await.unwrap();
        let mut new = String::new();
        new_reader.read_to_string(&mut new).await.unwrap();
        assert_eq!(old, "first\n");
        assert_eq!(new, "second\n");
    }

    #[tokio::test]
    async fn test_input_relay_stops_when_senders_drop() {
        let (input_tx, input_rx) = mpsc::channel::<Input>(4);
        let (log_tx, _log_rx) = mpsc::channel(4);
        let relay = tokio::spawn(run_input_relay(3, input_rx, log_tx));

        drop(input_tx);
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_output_relay_parses_and_inherits_class() {
        let (pipe_tx, pipe_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(16);
        let (mut writer, reader) = duplex(1024);
        let relay = tokio::spawn(run_output_relay(7, pipe_rx, log_tx));

        pipe_tx.send(Pipe::Active(reader)).await.unwrap();
        writer
            .write_all(b"10:11:12 [Server Warning] Low memory\nstack line\n")
            .await
            .unwrap();
        drop(writer);

        let first = log_rx.recv().await.unwrap();
        assert_eq!(first.server_id, 7);
        assert_eq!(first.class, "Server Warning");
        assert_eq!(first.message, "Low memory");
        let second = log_rx.recv().await.unwrap();
        assert_eq!(second.class, "Server Warning");
        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(second.message, "stack line");

        drop(pipe_tx);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_output_relay_forwards_unterminated_last_line() {
        let (pipe_tx, pipe_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(16);
        let (mut writer, reader) = duplex(1024);
        tokio::spawn(run_output_relay(1, pipe_rx, log_tx));

        pipe_tx.send(Pipe::Active(reader)).await.unwrap();
        writer.write_all(b"Shutting down").await.unwrap();
        drop(writer);

        let record = log_rx.recv().await.unwrap();
        assert_eq!(record.class, MONITOR_CLASS);
        assert_eq!(record.message, "Shutting down");
    }

    #[tokio::test]
    async fn test_output_relay_switches_to_new_pipe() {
        let (pipe_tx, pipe_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(16);
        let (_old_writer, old_reader) = duplex(64);
        let (mut new_writer, new_reader) = duplex(64);
        tokio::spawn(run_output_relay(1, pipe_rx, log_tx));

        pipe_tx.send(Pipe::Active(old_reader)).await.unwrap();
        pipe_tx.send(Pipe::Active(new_reader)).await.unwrap();
        new_writer.write_all(b"from the new child\n").await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), log_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.message, "from the new child");
    }

    #[tokio::test]
    async fn test_forwarder_publishes_until_senders_drop() {
        let sink = Arc::new(CollectingSink::default());
        let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        let forwarder = tokio::spawn(run_forwarder(log_rx, sink.clone()));

        log_tx.send(LogRecord::monitor(1, "one")).await.unwrap();
        log_tx.send(LogRecord::monitor(1, "two")).await.unwrap();
        drop(log_tx);
        forwarder.await.unwrap();

        assert_eq!(sink.messages(), vec!["one", "two"]);
    }
}
