//! IPC transports carrying progress events from the engine process to the
//! API process.
//!
//! Two interchangeable modes, selected by CLI flag at engine start and never
//! mixed mid-audit:
//! - **Queue-mode** (default): length-prefixed JSON frames over a unix
//!   domain socket the runner listens on. Lossless, ordered.
//! - **Stdout-mode** (fallback): one `##PROGRESS:`-prefixed JSON line per
//!   event on stdout. The reader ignores stray lines and resynchronizes on
//!   the next valid prefix, recording a gap.

pub mod queue;
pub mod stdout;

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::event::ProgressEvent;

pub use queue::{QueueEventReader, QueueTransport};
pub use stdout::{PROGRESS_PREFIX, StdoutEventReader, StdoutTransport};

/// Engine-side writer half of an IPC channel.
#[async_trait]
pub trait EventTransport: Send {
    /// Deliver one event, preserving per-audit ordering.
    async fn send(&mut self, event: &ProgressEvent) -> Result<(), TransportError>;

    /// Flush and release the channel. Idempotent.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// Transport selection, fixed at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcMode {
    Queue,
    Stdout,
}

impl IpcMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Stdout => "stdout",
        }
    }
}

impl std::str::FromStr for IpcMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Self::Queue),
            "stdout" => Ok(Self::Stdout),
            other => Err(format!("unknown ipc mode: {other}")),
        }
    }
}

impl std::fmt::Display for IpcMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
