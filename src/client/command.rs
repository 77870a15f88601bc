//! Foreign-thread command inbox.
//!
//! Every thread-safe entry point that mutates session state posts a typed
//! command onto a single-consumer queue drained by the session loop. Posting
//! is gated on the readiness flag: commands arriving before the loop is
//! wired, or after teardown started, are dropped silently. A stop request
//! additionally latches a flag so it wins over any queued work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Commands accepted from foreign threads.
#[derive(Debug, Clone)]
pub enum Command {
    /// End the session.
    Stop,
    /// Tear down the transport but keep session state for a later resume.
    Pause(String),
    /// Resume from a pause.
    Resume,
    /// Force a disconnect/reconnect cycle after a delay.
    Reconnect(Duration),
    /// Post a raw control-channel message.
    PostCcMsg(String),
    /// Send an app-custom control channel message.
    SendAppControl { protocol: String, payload: String },
    /// Restart the auxiliary cert-check handshake.
    StartCertCheck {
        cert: String,
        key: Option<String>,
        ca: Option<String>,
        epki_alias: Option<String>,
    },
}

impl Command {
    /// Whether this command may interrupt a pause.
    pub fn wakes_paused(&self) -> bool {
        matches!(
            self,
            Command::Stop | Command::Resume | Command::Reconnect(_)
        )
    }
}

/// The shared inbox handle.
pub struct CommandChannel {
    sender: Mutex<Option<UnboundedSender<Command>>>,
    stop_latch: AtomicBool,
}

impl CommandChannel {
    /// An unwired channel; posts are dropped until [`install`] runs.
    ///
    /// [`install`]: CommandChannel::install
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            stop_latch: AtomicBool::new(false),
        }
    }

    /// Wire the loop-side receiver end.
    pub fn install(&self) -> UnboundedReceiver<Command> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        self.stop_latch.store(false, Ordering::Release);
        rx
    }

    /// Unwire; subsequent posts are dropped.
    pub fn clear(&self) {
        *self.sender.lock() = None;
    }

    /// Post a command. Returns whether it was accepted. `ready` comes from
    /// the session's readiness flag.
    pub fn post(&self, command: Command, ready: bool) -> bool {
        if !ready {
            return false;
        }
        if matches!(command, Command::Stop) {
            self.stop_latch.store(true, Ordering::Release);
        }
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Whether a stop has been requested. Checked by the loop between
    /// commands so stop wins over queued work.
    pub fn stop_requested(&self) -> bool {
        self.stop_latch.load(Ordering::Acquire)
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}
