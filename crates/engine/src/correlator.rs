use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use tradesync_brokers_deriv::{InboundFrame, Request};
use tradesync_core::*;

/// A request that was sent and is waiting for its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub created_at: Instant,
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Answer to a pending request, which has been removed from the registry.
    Response {
        request: PendingRequest,
        frame: InboundFrame,
    },
    /// The back-end reported an error. `request` is set when it answered a
    /// pending request.
    RemoteError {
        kind: Option<RequestKind>,
        request: Option<PendingRequest>,
        message: String,
    },
    /// Nothing was waiting for this frame (e.g. a subscription push).
    Unsolicited(InboundFrame),
}

/// Assigns `req_id`s and keeps the registry of requests awaiting a response.
#[derive(Debug)]
pub struct Correlator {
    next_id: u64,
    pending: BTreeMap<RequestId, PendingRequest>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
            timeout,
        }
    }

    /// Encode `request` with a fresh id and send it. The request is only
    /// registered once the transport has accepted the frame.
    pub fn issue(
        &mut self,
        transport: &mut dyn Transport,
        request: &Request,
        now: Instant,
    ) -> Result<RequestId, TransportError> {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let frame = request.encode(id)?;
        transport.send(frame)?;

        let kind = request.kind();
        self.pending.insert(
            id,
            PendingRequest {
                id,
                kind,
                created_at: now,
            },
        );
        debug!(req_id = %id, %kind, pending = self.pending.len(), "Request issued");
        Ok(id)
    }

    /// Match an inbound frame against the registry.
    ///
    /// An echoed `req_id` must name a pending request of the frame's kind;
    /// error frames match on the id alone. Frames without an id are matched to
    /// the oldest pending request of the same kind. Anything else leaves the
    /// registry untouched.
    pub fn resolve(&mut self, frame: InboundFrame) -> Resolution {
        let matched = match frame.req_id {
            Some(id) => self.take_answered(id, &frame),
            None => frame.kind().and_then(|kind| self.take_oldest(kind)),
        };

        if let Some(error) = frame.error.clone() {
            let kind = matched.as_ref().map(|r| r.kind).or_else(|| frame.kind());
            return Resolution::RemoteError {
                kind,
                request: matched,
                message: error.message,
            };
        }

        match matched {
            Some(request) => Resolution::Response { request, frame },
            None => Resolution::Unsolicited(frame),
        }
    }

    fn take_answered(&mut self, id: RequestId, frame: &InboundFrame) -> Option<PendingRequest> {
        let pending = self.pending.get(&id)?;
        if frame.error.is_none() && frame.kind() != Some(pending.kind) {
            debug!(
                req_id = %id,
                expected = %pending.kind,
                msg_type = ?frame.msg_type,
                "Frame kind does not match request"
            );
            return None;
        }
        self.pending.remove(&id)
    }

    fn take_oldest(&mut self, kind: RequestKind) -> Option<PendingRequest> {
        let id = self
            .pending
            .values()
            .filter(|r| r.kind == kind)
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.id)?;
        self.pending.remove(&id)
    }

    /// Remove and return every request older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let timeout = self.timeout;
        let expired: Vec<RequestId> = self
            .pending
            .values()
            .filter(|r| now.saturating_duration_since(r.created_at) >= timeout)
            .map(|r| r.id)
            .collect();

        let expired: Vec<PendingRequest> = expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        for request in &expired {
            warn!(req_id = %request.id, kind = %request.kind, "Request timed out");
        }
        expired
    }

    /// When the oldest pending request times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|r| r.created_at + self.timeout)
            .min()
    }

    /// Abandon every pending request.
    pub fn clear(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.pending.values().any(|r| r.kind == kind)
    }
}
