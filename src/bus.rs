//! Progress event bus: single producer, single consumer, bounded.
//!
//! Producers publish [`EventDraft`]s; a pump task coalesces finding bursts,
//! throttles chatter, assigns sequence numbers, and writes to the IPC
//! transport. `publish` blocks when the channel is full; that backpressure
//! is what keeps the engine from outrunning IPC throughput.
//!
//! Sequence numbers are assigned *after* coalescing, immediately before the
//! transport write, so the wire sequence is gapless per audit regardless of
//! how many drafts were merged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::BusConfig;
use crate::errors::{EngineError, TransportError};
use crate::event::{EventDraft, EventKind};
use crate::ipc::EventTransport;

enum BusMessage {
    Event(EventDraft),
    Close,
}

/// Producer handle. Clonable; all clones share one sequence space.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<BusMessage>,
    closed: Arc<AtomicBool>,
}

impl EventBus {
    /// Build the bus and spawn its pump over the given transport.
    ///
    /// The returned handle resolves when the pump has drained and shut the
    /// transport down; its error is the first transport fault encountered.
    pub fn start(
        audit_id: &str,
        config: &BusConfig,
        transport: Box<dyn EventTransport>,
    ) -> (Self, JoinHandle<Result<u64, TransportError>>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));

        let pump = Pump {
            audit_id: audit_id.to_string(),
            rx,
            transport,
            next_seq: 1,
            events_per_second: config.events_per_second.max(1),
            coalesce_window: config.coalesce_window,
            window_start: Instant::now(),
            window_count: 0,
        };
        let handle = tokio::spawn(pump.run());

        (Self { tx, closed }, handle)
    }

    /// Publish one event draft. Blocks while the bus is at capacity; fails
    /// once the bus has been closed.
    pub async fn publish(&self, draft: EventDraft) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::EngineHalted);
        }
        self.tx
            .send(BusMessage::Event(draft))
            .await
            .map_err(|_| EngineError::EngineHalted)
    }

    /// Signal the pump to drain and exit. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // In-band close marker: everything published before this point is
        // still delivered.
        let _ = self.tx.send(BusMessage::Close).await;
    }
}

struct Pump {
    audit_id: String,
    rx: mpsc::Receiver<BusMessage>,
    transport: Box<dyn EventTransport>,
    next_seq: u64,
    events_per_second: u32,
    coalesce_window: Duration,
    window_start: Instant,
    window_count: u32,
}

impl Pump {
    /// Drain the channel to the transport. Returns the count of events
    /// written on clean shutdown.
    async fn run(mut self) -> Result<u64, TransportError> {
        loop {
            let Some(msg) = self.rx.recv().await else {
                break;
            };
            match msg {
                BusMessage::Close => break,
                BusMessage::Event(draft) if draft.kind == EventKind::Finding => {
                    if let Some(followup) = self.coalesce_and_emit(draft).await? {
                        match followup {
                            BusMessage::Close => break,
                            BusMessage::Event(next) => self.emit(next).await?,
                        }
                    }
                }
                BusMessage::Event(draft) => self.emit(draft).await?,
            }
        }
        self.transport.shutdown().await?;
        Ok(self.next_seq - 1)
    }

    /// Buffer findings arriving within the coalesce window, then emit either
    /// the lone finding or one merged `phase_progress`. Returns a non-finding
    /// message received during the window, which must still be handled.
    async fn coalesce_and_emit(
        &mut self,
        first: EventDraft,
    ) -> Result<Option<BusMessage>, TransportError> {
        let phase = first.phase;
        let mut buffer = vec![first];
        let window_end = Instant::now() + self.coalesce_window;
        let mut interrupt = None;

        loop {
            let remaining = window_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(BusMessage::Event(draft))) if draft.kind == EventKind::Finding => {
                    buffer.push(draft);
                }
                Ok(Some(other)) => {
                    interrupt = Some(other);
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        if buffer.len() == 1 {
            let draft = buffer.pop().ok_or(TransportError::Closed)?;
            self.emit(draft).await?;
        } else {
            self.emit(EventDraft::coalesce_findings(phase, buffer)).await?;
        }
        Ok(interrupt)
    }

    async fn emit(&mut self, draft: EventDraft) -> Result<(), TransportError> {
        if !draft.kind.is_critical() {
            self.throttle().await;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = draft.into_event(&self.audit_id, seq);
        self.transport.send(&event).await
    }

    /// At most `events_per_second` non-critical events per one-second
    /// window; excess events wait for the next window rather than drop.
    async fn throttle(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.window_count = 0;
        }
        if self.window_count >= self.events_per_second {
            let next_window = self.window_start + Duration::from_secs(1);
            tokio::time::sleep_until(next_window).await;
            self.window_start = next_window;
            self.window_count = 0;
        }
        self.window_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AuditPhase, ProgressEvent};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport that records everything it is handed.
    #[derive(Clone, Default)]
    struct CollectingTransport {
        events: Arc<Mutex<Vec<ProgressEvent>>>,
        shutdowns: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl EventTransport for CollectingTransport {
        async fn send(&mut self, event: &ProgressEvent) -> Result<(), TransportError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), TransportError> {
            *self.shutdowns.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn bus_config() -> BusConfig {
        BusConfig::default()
    }

    #[tokio::test]
    async fn sequence_numbers_are_gapless_from_one() {
        let transport = CollectingTransport::default();
        let events = transport.events.clone();
        let shutdowns = transport.shutdowns.clone();
        let (bus, handle) = EventBus::start("a-1", &bus_config(), Box::new(transport));

        bus.publish(EventDraft::phase_start(AuditPhase::Scout)).await.unwrap();
        bus.publish(EventDraft::phase_complete(AuditPhase::Scout, 10, 0)).await.unwrap();
        bus.publish(EventDraft::audit_complete("completed")).await.unwrap();
        bus.close().await;
        let written = handle.await.unwrap().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(written, events.len() as u64);
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(events.iter().all(|e| e.audit_id == "a-1"));
        assert_eq!(*shutdowns.lock().unwrap(), 1, "transport shut down once");
    }

    #[tokio::test]
    async fn publish_after_close_fails_with_engine_halted() {
        let transport = CollectingTransport::default();
        let (bus, handle) = EventBus::start("a-2", &bus_config(), Box::new(transport));

        bus.close().await;
        bus.close().await; // idempotent

        let err = bus
            .publish(EventDraft::log(None, "info", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineHalted));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn finding_burst_coalesces_into_one_progress_event() {
        let transport = CollectingTransport::default();
        let events = transport.events.clone();
        let (bus, handle) = EventBus::start("a-3", &bus_config(), Box::new(transport));

        let finding = crate::state::Finding::new(
            "urgency_timer",
            "dark_pattern",
            crate::state::Severity::Medium,
            0.8,
            "countdown detected",
        );
        for _ in 0..4 {
            bus.publish(EventDraft::finding(AuditPhase::Security, &finding))
                .await
                .unwrap();
        }
        bus.close().await;
        handle.await.unwrap().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1, "burst should coalesce to one event");
        assert_eq!(events[0].kind, EventKind::PhaseProgress);
        assert_eq!(events[0].sequence_no, 1);
        let findings = events[0].payload["findings"].as_array().unwrap();
        assert_eq!(findings.len(), 4);
    }

    #[tokio::test]
    async fn lone_finding_is_not_rewritten() {
        let transport = CollectingTransport::default();
        let events = transport.events.clone();
        let mut config = bus_config();
        config.coalesce_window = Duration::from_millis(10);
        let (bus, handle) = EventBus::start("a-4", &config, Box::new(transport));

        let finding = crate::state::Finding::new(
            "missing_hsts",
            "headers",
            crate::state::Severity::Low,
            0.9,
            "no strict-transport-security",
        );
        bus.publish(EventDraft::finding(AuditPhase::Security, &finding))
            .await
            .unwrap();
        // Give the coalesce window time to lapse before closing.
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.close().await;
        handle.await.unwrap().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Finding);
    }

    #[tokio::test]
    async fn terminal_event_after_findings_is_delivered_in_order() {
        let transport = CollectingTransport::default();
        let events = transport.events.clone();
        let (bus, handle) = EventBus::start("a-5", &bus_config(), Box::new(transport));

        let finding = crate::state::Finding::new(
            "x",
            "y",
            crate::state::Severity::Info,
            0.5,
            "z",
        );
        bus.publish(EventDraft::finding(AuditPhase::Graph, &finding)).await.unwrap();
        bus.publish(EventDraft::finding(AuditPhase::Graph, &finding)).await.unwrap();
        bus.publish(EventDraft::audit_result(serde_json::json!({"ok": true}))).await.unwrap();
        bus.publish(EventDraft::audit_complete("completed")).await.unwrap();
        bus.close().await;
        handle.await.unwrap().unwrap();

        let events = events.lock().unwrap();
        // Coalesced findings, then the two critical events, all ordered.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::PhaseProgress);
        assert_eq!(events[1].kind, EventKind::AuditResult);
        assert_eq!(events[2].kind, EventKind::AuditComplete);
        assert_eq!(
            events.iter().map(|e| e.sequence_no).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_critical_events_are_throttled_to_rate() {
        let transport = CollectingTransport::default();
        let events = transport.events.clone();
        let mut config = bus_config();
        config.events_per_second = 2;
        let (bus, handle) = EventBus::start("a-6", &config, Box::new(transport));

        let started = Instant::now();
        for n in 0..6 {
            bus.publish(EventDraft::log(None, "info", &format!("msg {n}")))
                .await
                .unwrap();
        }
        bus.close().await;
        handle.await.unwrap().unwrap();

        assert_eq!(events.lock().unwrap().len(), 6);
        // 6 events at 2/s need at least two extra windows.
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
