//! WebSocket boundary: progress events out to frontend consumers.
//!
//! The runner forwards every [`ProgressEvent`] as one JSON text frame on a
//! broadcast channel; any number of sockets subscribe. Clients rely on
//! `sequence_no` to reorder, so the bridge does no buffering of its own.
//!
//! Liveness probing is traffic-aware rather than fixed-interval: during an
//! active audit the event stream itself proves the connection, so pings go
//! out only after the socket has been silent longer than the longest stage
//! cap, and an unanswered ping past the pong grace tears the socket down.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::StageConfig;
use crate::event::ProgressEvent;

/// Liveness tuning for one socket, derived from the audit cadence.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Silence threshold before a ping is sent. A healthy audit cannot go
    /// quieter than its slowest stage, so the longest per-stage cap is the
    /// natural probe point.
    pub probe_after: Duration,
    /// How long an outstanding ping may wait for its pong.
    pub pong_grace: Duration,
}

impl KeepaliveConfig {
    /// Derive probe timing from the engine's stage caps: probe after one
    /// longest-stage silence, allow three cancel windows for the pong.
    pub fn from_stages(stages: &StageConfig) -> Self {
        let slowest_stage = stages
            .scout_timeout
            .max(stages.security_timeout)
            .max(stages.vision_timeout)
            .max(stages.graph_timeout)
            .max(stages.judge_timeout);
        Self {
            probe_after: slowest_stage,
            pong_grace: stages.graceful_cancel_timeout * 3,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::from_stages(&StageConfig::default())
    }
}

/// Serialize and broadcast one event to all connected sockets. Returns
/// silently when nobody is listening.
pub fn forward_event(tx: &broadcast::Sender<String>, event: &ProgressEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json); // no receivers is fine
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize progress event");
        }
    }
}

/// Axum upgrade handler wired to the runner's broadcast sender.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
    keepalive: KeepaliveConfig,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, tx.subscribe(), keepalive))
}

/// Pump broadcast frames to one client until it disconnects or goes dark.
///
/// A single wake deadline drives liveness: while a ping is in flight it is
/// the pong due time, otherwise it is the next probe point. Every frame in
/// either direction pushes the probe point out.
async fn serve_socket(
    socket: WebSocket,
    mut rx: broadcast::Receiver<String>,
    keepalive: KeepaliveConfig,
) {
    let (mut sink, mut source) = socket.split();
    let mut last_traffic = Instant::now();
    let mut pong_due: Option<Instant> = None;

    loop {
        let wake = pong_due.unwrap_or(last_traffic + keepalive.probe_after);

        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Pong(_))) => {
                    pong_due = None;
                    last_traffic = Instant::now();
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {
                    // The bridge is one-way; client text/binary is noise.
                }
            },

            frame = rx.recv() => match frame {
                Ok(json) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                    last_traffic = Instant::now();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Clients reorder by sequence_no and the full stream is
                    // in the repository, so a lagged consumer just resumes.
                    tracing::debug!(skipped, "websocket consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            () = tokio::time::sleep_until(wake) => {
                if pong_due.is_some() {
                    // The pong never came; the peer is gone.
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                pong_due = Some(Instant::now() + keepalive.pong_grace);
                last_traffic = Instant::now();
            }
        }
    }

    let _ = sink.close().await;
}
