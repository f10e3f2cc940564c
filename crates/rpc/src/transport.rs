//! Newline-delimited JSON transport over any async byte stream.
//!
//! A [`Transport`] owns two background tasks: a reader that turns each line
//! into a [`TransportEvent::Message`], and a writer that drains the outbound
//! queue. Both stop when the shared cancellation token fires. The reader
//! reports end-of-stream as [`TransportEvent::Closed`]; the writer reports a
//! failed write as [`TransportEvent::Disconnected`].

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle and traffic signals surfaced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Value),
    /// The peer closed its output stream.
    Closed,
    /// Writing to the peer failed.
    Disconnected(String),
    /// The child process exited with the given code, if any.
    Exited(Option<i32>),
}

/// A running line transport.
#[derive(Debug)]
pub struct Transport {
    pub(crate) outbound: UnboundedSender<String>,
    pub(crate) inbound: UnboundedReceiver<TransportEvent>,
    pub(crate) events: UnboundedSender<TransportEvent>,
    pub(crate) shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Spawns reader and writer tasks over the given halves.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let reader_task = spawn_reader(reader, events_tx.clone(), shutdown.child_token());
        let writer_task = spawn_writer(writer, outbound_rx, events_tx.clone(), shutdown.child_token());

        Self {
            outbound: outbound_tx,
            inbound: events_rx,
            events: events_tx,
            shutdown,
            tasks: vec![reader_task, writer_task],
        }
    }

    /// Creates two transports wired to each other in memory.
    pub fn pair() -> (Self, Self) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (Self::spawn(left_read, left_write), Self::spawn(right_read, right_write))
    }

    /// Handle used by process supervisors to inject lifecycle events.
    pub fn event_sender(&self) -> UnboundedSender<TransportEvent> {
        self.events.clone()
    }

    /// Token cancelled when the owning session shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub(crate) fn into_parts(self) -> TransportParts {
        TransportParts {
            outbound: self.outbound,
            inbound: self.inbound,
            shutdown: self.shutdown,
            tasks: self.tasks,
        }
    }
}

pub(crate) struct TransportParts {
    pub(crate) outbound: UnboundedSender<String>,
    pub(crate) inbound: UnboundedReceiver<TransportEvent>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

fn spawn_reader<R>(reader: R, events: UnboundedSender<TransportEvent>, shutdown: CancellationToken) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => {
                            if events.send(TransportEvent::Message(value)).is_err() {
                                break;
                            }
                        }
                        Err(error) => warn!(error = %error, "Dropping undecodable line from peer"),
                    }
                }
                Ok(None) => {
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
                Err(error) => {
                    let _ = events.send(TransportEvent::Disconnected(error.to_string()));
                    break;
                }
            }
        }
        debug!("Transport reader stopped");
    })
}

fn spawn_writer<W>(
    mut writer: W,
    mut outbound: UnboundedReceiver<String>,
    events: UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = outbound.recv() => line,
            };
            let Some(mut line) = line else {
                break;
            };
            line.push('\n');
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(error) = written {
                let _ = events.send(TransportEvent::Disconnected(error.to_string()));
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!("Transport writer stopped");
    })
}
