//! Bidirectional protocol channel over a pair of byte streams.
//!
//! The supervisor binds one to a worker's stdout/stdin; a worker binds one to
//! its own stdin/stdout. Inbound lines are decoded and dispatched to an
//! [`EventBus`] by a reader task; outbound frames go through an mpsc queue
//! drained by a single writer task, so concurrent senders never interleave
//! mid-line and frames leave in the order they were queued.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::bus::EventBus;
use super::codec::{Decoded, decode, encode};

/// Capacity of the outbound frame queue.
const OUTBOUND_CAPACITY: usize = 64;

/// Longest inbound line that is decoded. Longer lines reach the raw
/// handlers in chunks of this size and are never treated as frames.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Errors from channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Outbound queue full")]
    Full,
}

/// Clonable handle for queueing outbound frames.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<String>,
}

impl ChannelSender {
    /// Frame and queue a message, waiting for queue space.
    pub async fn send(&self, msg_type: &str, payload: Value) -> Result<(), ChannelError> {
        self.tx
            .send(encode(msg_type, payload))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Frame and queue a message without waiting. Usable from sync handlers.
    pub fn try_send(&self, msg_type: &str, payload: Value) -> Result<(), ChannelError> {
        self.tx
            .try_send(encode(msg_type, payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Full,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running protocol channel.
pub struct WorkerChannel {
    sender: ChannelSender,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    stop: CancellationToken,
    closed: CancellationToken,
}

impl WorkerChannel {
    /// Start the reader and writer tasks.
    ///
    /// `label` identifies the peer in log lines (owner id or "supervisor").
    pub fn spawn<R, W>(reader: R, writer: W, bus: EventBus, label: &str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with(reader, writer, bus, label, |_, _| {})
    }

    /// Like [`spawn`](Self::spawn), but runs `setup` before the reader starts,
    /// so handlers that reply through the channel see the very first frame.
    pub fn spawn_with<R, W, F>(reader: R, writer: W, bus: EventBus, label: &str, setup: F) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(&EventBus, ChannelSender),
    {
        let stop = CancellationToken::new();
        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        setup(&bus, ChannelSender { tx: tx.clone() });

        let reader = tokio::spawn(read_loop(
            reader,
            bus,
            label.to_string(),
            stop.clone(),
            closed.clone(),
        ));
        let writer = Some(tokio::spawn(write_loop(writer, rx, label.to_string())));

        Self {
            sender: ChannelSender { tx },
            reader,
            writer,
            stop,
            closed,
        }
    }

    /// Frame and send a message to the peer.
    pub async fn send(&self, msg_type: &str, payload: Value) -> Result<(), ChannelError> {
        self.sender.send(msg_type, payload).await
    }

    /// A clonable sender for use from handlers and other tasks.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Stop the inbound reader. Outbound sends keep working until drop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait until the inbound reader has finished (end of stream or stop).
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop reading and wait, up to `limit`, for queued frames to be written.
    ///
    /// The writer drains once every [`ChannelSender`] is gone, so drop other
    /// senders first. Handlers registered on the bus are dropped with the
    /// reader.
    pub async fn shutdown(mut self, limit: Duration) {
        let writer = self.writer.take();
        drop(self);
        if let Some(writer) = writer
            && tokio::time::timeout(limit, writer).await.is_err()
        {
            debug!("Writer still busy at shutdown");
        }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.stop.cancel();
        self.reader.abort();
        // The writer is left running: it ends on its own once every sender is
        // gone, after flushing frames queued just before the drop.
    }
}

async fn read_loop<R>(
    reader: R,
    bus: EventBus,
    label: String,
    stop: CancellationToken,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    // Set while the tail of an over-long line is still arriving.
    let mut oversized = false;

    loop {
        buf.clear();
        let read = tokio::select! {
            () = stop.cancelled() => break,
            read = read_line_bounded(&mut reader, &mut buf, MAX_LINE_BYTES) => read,
        };

        match read {
            Ok(Chunk::Eof) => break,
            Ok(Chunk::Partial) => {
                if !oversized {
                    warn!(
                        peer = %label,
                        limit = MAX_LINE_BYTES,
                        "Line too long, passing it through as plain output"
                    );
                    oversized = true;
                }
                bus.dispatch_raw(&String::from_utf8_lossy(&buf));
            }
            Ok(Chunk::Line) => {
                // Lossy: a stray invalid byte must not end the stream.
                let line = String::from_utf8_lossy(&buf);
                if oversized {
                    oversized = false;
                    bus.dispatch_raw(line.trim_end_matches(['\r', '\n']));
                    continue;
                }
                match decode(&line) {
                    Decoded::Message(envelope) => {
                        trace!(peer = %label, msg_type = %envelope.msg_type, "Frame received");
                        bus.dispatch(&envelope);
                    }
                    Decoded::Plain(text) => {
                        bus.dispatch_raw(text);
                    }
                    Decoded::Malformed(reason) => {
                        debug!(peer = %label, %reason, "Dropping malformed frame");
                    }
                }
            }
            Err(e) => {
                error!(peer = %label, error = %e, "Failed to read from stream");
                break;
            }
        }
    }

    debug!(peer = %label, "Reader finished");
    closed.cancel();
}

/// Outcome of one bounded line read.
#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    /// A full line, newline included unless the stream ended first.
    Line,
    /// `max` bytes without a newline; more of the line follows.
    Partial,
    Eof,
}

/// Like `read_until(b'\n')`, but stops after `max` bytes.
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Chunk>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() { Chunk::Eof } else { Chunk::Line });
        }

        let room = max.saturating_sub(buf.len());
        let window = &available[..available.len().min(room)];
        if let Some(i) = window.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&window[..=i]);
            reader.consume(i + 1);
            return Ok(Chunk::Line);
        }

        let taken = window.len();
        buf.extend_from_slice(window);
        reader.consume(taken);
        if buf.len() >= max {
            return Ok(Chunk::Partial);
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<String>, label: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(peer = %label, "Failed to write frame: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!(peer = %label, "Failed to write newline: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!(peer = %label, "Failed to flush: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!(peer = %label, "Writer finished");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, PREFIX};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    /// Bus that records typed messages and raw lines.
    fn recording_bus() -> (EventBus, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let bus = EventBus::new();
        let typed = Arc::new(Mutex::new(Vec::new()));
        let raw = Arc::new(Mutex::new(Vec::new()));
        for t in [MessageType::STEP_UPDATE, MessageType::PONG] {
            let typed = Arc::clone(&typed);
            bus.on(t, move |env| {
                typed.lock().unwrap().push(env.msg_type.clone());
                Ok(())
            });
        }
        let r = Arc::clone(&raw);
        bus.on_raw(move |line| {
            r.lock().unwrap().push(line.to_string());
            Ok(())
        });
        (bus, typed, raw)
    }

    #[tokio::test]
    async fn malformed_frames_do_not_stop_the_reader() {
        let (bus, typed, raw) = recording_bus();
        let (mut peer, local) = duplex(4096);
        let (local_read, local_write) = tokio::io::split(local);
        let channel = WorkerChannel::spawn(local_read, local_write, bus, "test");

        let input = format!(
            "{PREFIX}{{broken\n{PREFIX}{{\"payload\":{{}}}}\n{PREFIX}{{\"type\":\"pong\"}}\nplain output\n{PREFIX}{{\"type\":\"pong\",\"payload\":{{}}}}\n"
        );
        tokio::io::AsyncWriteExt::write_all(&mut peer, input.as_bytes())
            .await
            .unwrap();
        drop(peer);

        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();

        assert_eq!(*typed.lock().unwrap(), vec!["pong".to_string()]);
        // The three malformed frames reach no handler at all.
        assert_eq!(*raw.lock().unwrap(), vec!["plain output".to_string()]);
    }

    #[tokio::test]
    async fn over_long_lines_pass_through_as_plain_chunks() {
        let (bus, typed, raw) = recording_bus();
        let (mut peer, local) = duplex(64 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let channel = WorkerChannel::spawn(local_read, local_write, bus, "test");

        // An over-long line that would otherwise decode as a frame.
        let mut input = format!("{PREFIX}{{\"type\":\"pong\",\"payload\":{{\"pad\":\"");
        input.push_str(&"x".repeat(MAX_LINE_BYTES));
        input.push_str(&format!("\"}}}}\n{PREFIX}{{\"type\":\"pong\",\"payload\":{{}}}}\n"));
        let writer = tokio::spawn(async move {
            tokio::io::AsyncWriteExt::write_all(&mut peer, input.as_bytes())
                .await
                .unwrap();
        });

        tokio::time::timeout(Duration::from_secs(10), channel.closed())
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(*typed.lock().unwrap(), vec!["pong".to_string()]);
        let raw = raw.lock().unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].len(), MAX_LINE_BYTES);
        assert!(raw[1].ends_with("\"}}"));
    }

    #[tokio::test]
    async fn bounded_read_splits_at_the_limit() {
        let mut reader = BufReader::new(&b"abcdefgh\nxy"[..]);
        let mut buf = Vec::new();

        assert_eq!(read_line_bounded(&mut reader, &mut buf, 5).await.unwrap(), Chunk::Partial);
        assert_eq!(buf, b"abcde");
        buf.clear();
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 5).await.unwrap(), Chunk::Line);
        assert_eq!(buf, b"fgh\n");
        buf.clear();
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 5).await.unwrap(), Chunk::Line);
        assert_eq!(buf, b"xy");
        buf.clear();
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 5).await.unwrap(), Chunk::Eof);
    }

    #[tokio::test]
    async fn send_writes_one_flushed_line_per_frame() {
        let (bus, _, _) = recording_bus();
        let (mut peer, local) = duplex(4096);
        let (local_read, local_write) = tokio::io::split(local);
        let channel = WorkerChannel::spawn(local_read, local_write, bus, "test");

        channel
            .send(MessageType::USER_MESSAGE, json!({"content": "hi"}))
            .await
            .unwrap();
        channel
            .sender()
            .try_send(MessageType::PING, json!({}))
            .unwrap();
        drop(channel);

        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_string(&mut out))
            .await
            .unwrap()
            .unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let Decoded::Message(first) = decode(lines[0]) else {
            panic!("expected frame");
        };
        assert_eq!(first.msg_type, "user_message");
        assert_eq!(first.payload["content"], "hi");
        assert!(matches!(decode(lines[1]), Decoded::Message(e) if e.msg_type == "ping"));
    }

    #[tokio::test]
    async fn concurrent_senders_never_interleave() {
        let (bus, _, _) = recording_bus();
        let (mut peer, local) = duplex(1 << 20);
        let (local_read, local_write) = tokio::io::split(local);
        let channel = WorkerChannel::spawn(local_read, local_write, bus, "test");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let sender = channel.sender();
            tasks.push(tokio::spawn(async move {
                for j in 0..25 {
                    let content = format!("{i}-{j}-{}", "x".repeat(512));
                    sender
                        .send(MessageType::AGENT_CHAT_MESSAGE, json!({ "content": content }))
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(channel);

        let mut out = String::new();
        peer.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 200);
        assert!(lines
            .iter()
            .all(|l| matches!(decode(l), Decoded::Message(_))));
    }

    #[tokio::test]
    async fn stop_ends_reader_while_stream_is_open() {
        let (bus, _, _) = recording_bus();
        let (_peer, local) = duplex(64);
        let (local_read, local_write) = tokio::io::split(local);
        let channel = WorkerChannel::spawn(local_read, local_write, bus, "test");

        assert!(!channel.is_closed());
        channel.stop();
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn setup_handlers_answer_the_first_frame() {
        let (mut peer, local) = duplex(4096);
        let (local_read, local_write) = tokio::io::split(local);
        let ping = format!("{}\n", encode(MessageType::PING, json!({})));
        tokio::io::AsyncWriteExt::write_all(&mut peer, ping.as_bytes())
            .await
            .unwrap();

        let _channel = WorkerChannel::spawn_with(
            local_read,
            local_write,
            EventBus::new(),
            "test",
            |bus, sender| {
                bus.on(MessageType::PING, move |_| {
                    sender.try_send(MessageType::PONG, json!({}))?;
                    Ok(())
                });
            },
        );

        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(decode(&line), Decoded::Message(e) if e.msg_type == "pong"));
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_frames() {
        let (mut peer, local) = duplex(4096);
        let (local_read, local_write) = tokio::io::split(local);
        let channel = WorkerChannel::spawn(local_read, local_write, EventBus::new(), "test");

        channel
            .sender()
            .try_send(MessageType::AGENT_CHAT_MESSAGE, json!({"content": "bye"}))
            .unwrap();
        channel.shutdown(Duration::from_secs(5)).await;

        let mut out = String::new();
        peer.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.lines().count(), 1);
    }
}
