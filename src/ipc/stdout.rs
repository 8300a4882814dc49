//! Stdout-mode transport: `##PROGRESS:`-prefixed JSON lines.
//!
//! Fallback mode for environments where the socket channel cannot be
//! established. Every event is one line on the engine's stdout; anything
//! else on that stream (stray prints from a dependency) is ignored by the
//! reader. A prefixed line that fails to decode is dropped and counted as
//! a gap; the reader resynchronizes on the next valid line.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use super::EventTransport;
use crate::errors::TransportError;
use crate::event::ProgressEvent;

/// Literal marker the reader keys on.
pub const PROGRESS_PREFIX: &str = "##PROGRESS:";

/// Writer half: engine side.
pub struct StdoutTransport<W: AsyncWrite + Unpin + Send> {
    writer: Option<W>,
}

impl StdoutTransport<tokio::io::Stdout> {
    /// Standard wiring: the engine's own stdout.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> StdoutTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Some(writer) }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventTransport for StdoutTransport<W> {
    async fn send(&mut self, event: &ProgressEvent) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        // serde_json emits single-line output; embedded newlines in payload
        // strings are escaped, so the one-event-per-line invariant holds.
        let mut line = String::with_capacity(PROGRESS_PREFIX.len() + 256);
        line.push_str(PROGRESS_PREFIX);
        line.push_str(&serde_json::to_string(event)?);
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }
}

/// Reader half: runner side, wrapped around the child's stdout.
pub struct StdoutEventReader<R: tokio::io::AsyncRead + Unpin + Send> {
    lines: Lines<BufReader<R>>,
    /// Prefixed lines that failed to decode since the stream opened.
    gaps: u64,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> StdoutEventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            gaps: 0,
        }
    }

    /// Count of malformed prefixed lines dropped so far.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Next decodable event, skipping stray and malformed lines.
    /// `None` means the stream ended.
    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent, TransportError>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(body) = parse_progress_line(&line) else {
                        continue; // stray output, not ours
                    };
                    match serde_json::from_str::<ProgressEvent>(body) {
                        Ok(event) => return Some(Ok(event)),
                        Err(_) => {
                            self.gaps += 1;
                            continue;
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(TransportError::Io(e))),
            }
        }
    }
}

/// Strip the progress prefix from a line, if present.
pub fn parse_progress_line(line: &str) -> Option<&str> {
    line.strip_prefix(PROGRESS_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AuditPhase, EventDraft};

    #[tokio::test]
    async fn lines_roundtrip_and_strays_are_skipped() {
        let (client, server) = tokio::io::duplex(8192);

        let mut transport = StdoutTransport::new(client);
        let first =
            EventDraft::phase_start(AuditPhase::Scout).into_event("audit-s", 1);
        transport.send(&first).await.unwrap();

        // Simulate a dependency printing to stdout between events.
        {
            use tokio::io::AsyncWriteExt;
            let w = transport.writer.as_mut().unwrap();
            w.write_all(b"warning: something unrelated\n").await.unwrap();
            w.write_all(b"##PROGRESS:{broken json\n").await.unwrap();
        }

        let second =
            EventDraft::phase_complete(AuditPhase::Scout, 1200, 0).into_event("audit-s", 2);
        transport.send(&second).await.unwrap();
        transport.shutdown().await.unwrap();
        drop(transport);

        let mut reader = StdoutEventReader::new(server);
        let a = reader.next_event().await.unwrap().unwrap();
        assert_eq!(a.sequence_no, 1);
        let b = reader.next_event().await.unwrap().unwrap();
        assert_eq!(b.sequence_no, 2);
        assert!(reader.next_event().await.is_none());

        // The malformed prefixed line was counted; the stray line was not.
        assert_eq!(reader.gaps(), 1);
    }

    #[test]
    fn prefix_parsing() {
        assert_eq!(
            parse_progress_line("##PROGRESS:{\"a\":1}"),
            Some("{\"a\":1}")
        );
        assert!(parse_progress_line("PROGRESS:{}").is_none());
        assert!(parse_progress_line("random output").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[tokio::test]
    async fn send_after_shutdown_reports_closed() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut transport = StdoutTransport::new(client);
        transport.shutdown().await.unwrap();

        let event = EventDraft::audit_complete("completed").into_event("audit-s", 1);
        assert!(matches!(
            transport.send(&event).await,
            Err(TransportError::Closed)
        ));
    }
}
