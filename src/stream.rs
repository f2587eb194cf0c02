//! Streaming response delivery with token accounting on the side.
//!
//! Upstream bytes pass through to the caller unmodified; a copy of each
//! chunk feeds the stream token counter. The audit entry for a streamed
//! request is emitted exactly once, when the stream ends or when the
//! caller drops it mid-flight.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::BoxStream;

use crate::audit::{AuditLogger, LogEntry};
use crate::tokens::StreamTokenCounter;

/// Everything needed to complete the audit entry once the stream settles.
pub struct StreamAudit {
    logger: AuditLogger,
    entry: LogEntry,
    started: Instant,
}

impl StreamAudit {
    pub fn new(logger: AuditLogger, entry: LogEntry, started: Instant) -> Self {
        Self {
            logger,
            entry,
            started,
        }
    }

    fn finish(mut self, counter: &StreamTokenCounter) {
        self.entry.usage.output_tokens = counter.finalize();
        self.entry.total_ms = Some(elapsed_ms(self.started));
        if let Some(last) = self.entry.attempts.last_mut() {
            last.total_ms = self.entry.total_ms;
        }
        self.logger.emit(self.entry);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Pass-through byte stream that counts tokens and finalizes the audit
/// entry. Dropping it before exhaustion still emits, with the tokens
/// counted so far.
pub struct AuditedStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    counter: StreamTokenCounter,
    audit: Option<StreamAudit>,
}

impl AuditedStream {
    pub fn new(
        response: reqwest::Response,
        counter: StreamTokenCounter,
        audit: StreamAudit,
    ) -> Self {
        Self {
            inner: Box::pin(response.bytes_stream()),
            counter,
            audit: Some(audit),
        }
    }

    #[cfg(test)]
    fn from_stream(
        inner: BoxStream<'static, reqwest::Result<Bytes>>,
        counter: StreamTokenCounter,
        audit: StreamAudit,
    ) -> Self {
        Self {
            inner,
            counter,
            audit: Some(audit),
        }
    }

    fn finish(&mut self) {
        if let Some(audit) = self.audit.take() {
            audit.finish(&self.counter);
        }
    }
}

impl Stream for AuditedStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                self.counter.push_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.finish();
                Poll::Ready(Some(Err(io::Error::other(err))))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for AuditedStream {
    fn drop(&mut self) {
        self.finish();
    }
}
