//! Per-session event queue: the LLSD long-poll channel used for
//! asynchronous server → viewer notifications.
//!
//! The HTTP transport is external; it hands each long poll in as an opaque
//! [`PollId`] and acts on the outcomes this module returns (respond now,
//! resume a parked poll, or time one out with 502).

use crate::llsd::Llsd;

/// Opaque token for a parked long-poll request, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollId(pub u64);

/// Seconds a poll may stay parked before it completes empty with 502.
pub const POLL_TIMEOUT: f64 = 10.0;

/// Request body size guard.
pub const MAX_POLL_BODY: usize = 4096;

#[derive(Debug)]
pub enum PollOutcome {
    /// Respond immediately with this body.
    Respond(Llsd),
    /// Duplicate ack: re-send the previous response verbatim.
    Resend(Llsd),
    /// Nothing queued; the transport parks the request until resumed.
    Deferred,
    /// Malformed request; 400.
    BadRequest,
}

/// What the transport must do after a poll request: act on `outcome`, and
/// complete any superseded earlier poll with 502.
#[derive(Debug)]
pub struct PollAction {
    pub outcome: PollOutcome,
    pub cancel: Option<PollId>,
}

pub struct EventQueue {
    queued: Vec<Llsd>,
    last: Option<Llsd>,
    ctr: i32,
    poll: Option<PollId>,
    deadline: f64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queued: Vec::new(),
            last: None,
            ctr: 0,
            poll: None,
            deadline: 0.0,
        }
    }

    fn build_response(&mut self) -> Llsd {
        self.ctr += 1;
        let mut resp = Llsd::map();
        resp.insert("events", Llsd::Array(std::mem::take(&mut self.queued)));
        resp.insert("id", Llsd::Int(self.ctr));
        self.last = Some(resp.clone());
        resp
    }

    /// Queue one event. If a poll is parked, it resumes immediately: the
    /// transport must complete `PollId` with the returned body.
    pub fn send(&mut self, name: &str, body: Llsd) -> Option<(PollId, Llsd)> {
        let mut event = Llsd::map();
        event.insert("message", Llsd::String(name.to_string()));
        event.insert("body", body);
        self.queued.push(event);

        let poll = self.poll.take()?;
        Some((poll, self.build_response()))
    }

    /// Handle an EventQueueGet request. An ack older than the last response
    /// id replays that response; the client deduplicates.
    pub fn poll_request(&mut self, ack: Option<i32>, poll: PollId, now: f64) -> PollAction {
        if let (Some(ack), Some(last)) = (ack, self.last.as_ref()) {
            if ack < self.ctr {
                return PollAction {
                    outcome: PollOutcome::Resend(last.clone()),
                    cancel: None,
                };
            }
        }

        // at most one outstanding poll; a newcomer supersedes it
        let cancel = self.poll.take();

        if !self.queued.is_empty() {
            return PollAction {
                outcome: PollOutcome::Respond(self.build_response()),
                cancel,
            };
        }

        self.poll = Some(poll);
        self.deadline = now + POLL_TIMEOUT;
        PollAction {
            outcome: PollOutcome::Deferred,
            cancel,
        }
    }

    /// A poll parked longer than [`POLL_TIMEOUT`] completes with 502.
    pub fn check_timeout(&mut self, now: f64) -> Option<PollId> {
        if self.poll.is_some() && now > self.deadline {
            return self.poll.take();
        }
        None
    }

    /// Session teardown: any parked poll completes with 502.
    pub fn close(&mut self) -> Option<PollId> {
        self.poll.take()
    }

    pub fn pending_events(&self) -> usize {
        self.queued.len()
    }

    pub fn last_id(&self) -> i32 {
        self.ctr
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_resumes_parked_poll() {
        let mut q = EventQueue::new();
        let action = q.poll_request(None, PollId(1), 0.0);
        assert!(matches!(action.outcome, PollOutcome::Deferred));
        let (poll, resp) = q.send("TestMessage", Llsd::map()).expect("poll resumed");
        assert_eq!(poll, PollId(1));
        assert_eq!(resp.get("id").and_then(|v| v.as_int()), Some(1));
        assert_eq!(resp.get("events").map(|e| e.len()), Some(1));
    }

    #[test]
    fn stale_ack_replays_last_response() {
        let mut q = EventQueue::new();
        q.send("A", Llsd::map());
        q.send("B", Llsd::map());
        let first = match q.poll_request(None, PollId(1), 0.0).outcome {
            PollOutcome::Respond(r) => r,
            other => panic!("expected response, got {:?}", other),
        };
        // client acks one behind: must receive the same response verbatim
        match q.poll_request(Some(0), PollId(2), 1.0).outcome {
            PollOutcome::Resend(r) => assert_eq!(r, first),
            other => panic!("expected resend, got {:?}", other),
        }
    }

    #[test]
    fn parked_poll_times_out() {
        let mut q = EventQueue::new();
        q.poll_request(None, PollId(9), 100.0);
        assert_eq!(q.check_timeout(105.0), None);
        assert_eq!(q.check_timeout(110.5), Some(PollId(9)));
        assert_eq!(q.check_timeout(111.0), None);
    }
}
