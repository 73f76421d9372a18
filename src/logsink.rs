//! Log sink bridge (spec §3 `RequestLog`, §6 "Log sink collaborator"). The
//! core never writes files or sockets directly — every request and error
//! record passes through `tracing`, matching how `cmux-proxy` and
//! `cmux-sandbox` treat their own loggers as injectable (SPEC_FULL §1.1);
//! this module additionally keeps the bounded in-memory ring the admin
//! surface reads from.

use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::state::{RequestLogEntry, RequestLogRing};

/// Opened when a request enters the system; [`RequestTimer::finish`] closes
/// it out, mirroring the "created on entry, finalized on completion"
/// lifecycle spec.md §3 describes.
pub struct RequestTimer {
    id: String,
    started: Instant,
    method: String,
    path: String,
    source_ip: String,
    user_agent: String,
    protocol: String,
}

impl RequestTimer {
    pub fn start(method: &str, path: &str, source_ip: &str, user_agent: &str, protocol: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::info!(
            request_id = %id,
            method,
            path,
            source_ip,
            protocol,
            "request started"
        );
        RequestTimer {
            id,
            started: Instant::now(),
            method: method.to_string(),
            path: path.to_string(),
            source_ip: source_ip.to_string(),
            user_agent: user_agent.to_string(),
            protocol: protocol.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pushes the completed entry into the ring and emits the detail
    /// record. `status` is `None` when the request failed before a status
    /// could be produced (e.g. a malformed request body).
    pub fn finish(self, ring: &RequestLogRing, status: Option<u16>) {
        let rtt_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(
            request_id = %self.id,
            method = %self.method,
            path = %self.path,
            status = status.unwrap_or(0),
            rtt_ms,
            "request completed"
        );
        ring.push(RequestLogEntry {
            id: self.id,
            timestamp_ms: Utc::now().timestamp_millis(),
            method: self.method,
            path: self.path,
            source_ip: self.source_ip,
            user_agent: self.user_agent,
            protocol: self.protocol,
            status,
            rtt_ms: Some(rtt_ms),
        });
    }
}

/// Error record for predicate/script/backend failures (spec §7). Always a
/// `warn!`-or-above `tracing` event; the core keeps no separate error log.
pub fn record_error(request_id: &str, kind: &str, message: &str) {
    tracing::warn!(request_id, kind, message, "runtime error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_pushes_an_entry_with_the_same_id() {
        let ring = RequestLogRing::new(4);
        let timer = RequestTimer::start("GET", "/x", "127.0.0.1", "test-agent", "http");
        let id = timer.id().to_string();
        timer.finish(&ring, Some(200));
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, id);
        assert_eq!(snap[0].status, Some(200));
    }
}
