//! Inbound control of a running worker.
//!
//! The supervisor steers a worker with `command` frames (stop, pause,
//! resume), checks liveness with `ping`, and forwards operator notes as
//! `user_message`. Handlers run on the channel reader, so they only flip
//! state here and queue replies; the runner polls the state between steps.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use hive_core::protocol::{ChannelSender, CommandPayload, ContentPayload, EventBus, MessageType};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared stop/pause flags and the operator message queue.
#[derive(Debug)]
pub struct Control {
    stop: CancellationToken,
    paused: watch::Sender<bool>,
    messages: Mutex<VecDeque<String>>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            stop: CancellationToken::new(),
            paused: watch::Sender::new(false),
            messages: Mutex::new(VecDeque::new()),
        }
    }
}

impl Control {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Completes once a stop has been requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Block while paused. Returns early on a stop request.
    pub async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = self.stop.cancelled() => return,
            }
        }
    }

    pub fn push_message(&self, content: String) {
        self.lock_messages().push_back(content);
    }

    /// Take every queued operator message, oldest first.
    pub fn drain_messages(&self) -> Vec<String> {
        self.lock_messages().drain(..).collect()
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the `ping`, `user_message` and `command` handlers.
    pub fn register(self: &Arc<Self>, bus: &EventBus, sender: &ChannelSender) {
        let tx = sender.clone();
        bus.on(MessageType::PING, move |_| {
            tx.try_send(MessageType::PONG, json!({}))?;
            Ok(())
        });

        let control = Arc::clone(self);
        let tx = sender.clone();
        bus.on(MessageType::USER_MESSAGE, move |env| {
            let msg: ContentPayload = env.payload_as()?;
            info!(content = %msg.content, "Operator message received");
            let ack = format!("Received message: {}", msg.content);
            control.push_message(msg.content);
            tx.try_send(MessageType::AGENT_CHAT_MESSAGE, json!({ "content": ack }))?;
            Ok(())
        });

        let control = Arc::clone(self);
        let tx = sender.clone();
        bus.on(MessageType::COMMAND, move |env| {
            let cmd: CommandPayload = env.payload_as()?;
            let reply = control.apply(&cmd.command);
            tx.try_send(MessageType::AGENT_CHAT_MESSAGE, json!({ "content": reply }))?;
            Ok(())
        });
    }

    /// Apply a command and return the reply for the supervisor.
    fn apply(&self, command: &str) -> String {
        info!(command, "Command received");
        match command {
            "stop" => {
                self.request_stop();
                "Stopping: the current feature will be released".to_string()
            }
            "pause" => {
                self.pause();
                "Paused".to_string()
            }
            "resume" => {
                self.resume();
                "Resumed".to_string()
            }
            other => format!("Error: unknown command '{other}'"),
        }
    }
}
