//! Time-sorted, conversation-aware bounded buffer of network records.
//!
//! Held by the network feature (not the server); callers serialize access
//! with a mutex, mirroring the rest of this crate's "lock outside, never
//! across I/O" discipline.

use link_protocol::{estimate_len, Record};
use std::collections::{HashMap, HashSet};

/// A bounded, time-ordered buffer with conversation-aware eviction.
///
/// Records are kept sorted non-decreasing by `tWallMs`; insertion ties are
/// broken by insertion order (new records with an equal timestamp land after
/// existing ones). A request or websocket conversation that is still open —
/// no terminal record yet, or an active response stream — is "pinned" and
/// survives both window expiry and cap-driven eviction.
pub struct EventBuffer {
    buffer_window_ms: i64,
    max_events: usize,
    max_bytes: usize,
    records: Vec<Record>,
    open_websockets: HashSet<String>,
    active_response_streams: HashSet<String>,
    approx_bytes: usize,
}

enum Droppable {
    Single(usize),
    RequestGroup(String),
    WebSocketGroup(String),
}

impl EventBuffer {
    pub fn new(buffer_window_ms: i64, max_events: usize, max_bytes: usize) -> Self {
        Self {
            buffer_window_ms,
            max_events,
            max_bytes,
            records: Vec::new(),
            open_websockets: HashSet::new(),
            active_response_streams: HashSet::new(),
            approx_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn is_websocket_open(&self, id: &str) -> bool {
        self.open_websockets.contains(id)
    }

    pub fn is_response_stream_active(&self, id: &str) -> bool {
        self.active_response_streams.contains(id)
    }

    /// Insert `record`, maintaining time order, then run window and cap
    /// eviction. Insertion itself never fails.
    pub fn append(&mut self, record: Record) {
        self.update_indexes_on_insert(&record);

        let t = record.wall_time_ms();
        let pos = self.records.partition_point(|r| r.wall_time_ms() <= t);
        self.approx_bytes += estimate_len(&record);
        self.records.insert(pos, record);

        if t != i64::MAX {
            self.evict_window(t - self.buffer_window_ms);
        }
        self.trim_to_caps();
    }

    /// A time-ordered copy of the buffer's contents, for replay-on-open.
    pub fn snapshot(&self) -> Vec<Record> {
        self.records.clone()
    }

    /// Attach body information to the most recently inserted `ResponseReceived`
    /// for `id`. Returns `false` if no such record exists.
    pub fn update_latest_response_body(
        &mut self,
        id: &str,
        body_preview: Option<String>,
        body: Option<String>,
        encoding: Option<String>,
        truncated: Option<bool>,
        size: Option<u64>,
    ) -> bool {
        let Some(rr) = self.records.iter_mut().rev().find_map(|r| match r {
            Record::ResponseReceived(rr) if rr.id == id => Some(rr),
            _ => None,
        }) else {
            return false;
        };

        let old_len = estimate_len(&Record::ResponseReceived(rr.clone()));
        rr.body_preview = body_preview;
        rr.body = body;
        rr.encoding = encoding;
        rr.truncated = truncated;
        rr.size = size;
        let new_len = estimate_len(&Record::ResponseReceived(rr.clone()));

        if new_len >= old_len {
            self.approx_bytes += new_len - old_len;
        } else {
            self.approx_bytes -= old_len - new_len;
        }
        true
    }

    fn update_indexes_on_insert(&mut self, record: &Record) {
        match record {
            Record::WebSocketWillOpen(r) => {
                self.open_websockets.insert(r.id.clone());
            }
            Record::WebSocketOpened(r) => {
                self.open_websockets.insert(r.id.clone());
            }
            Record::WebSocketClosed(r) => {
                self.open_websockets.remove(&r.id);
            }
            Record::WebSocketFailed(r) => {
                self.open_websockets.remove(&r.id);
            }
            Record::WebSocketCancelled(r) => {
                self.open_websockets.remove(&r.id);
            }
            Record::ResponseStreamEvent(r) => {
                self.active_response_streams.insert(r.id.clone());
            }
            Record::ResponseStreamClosed(r) => {
                self.active_response_streams.remove(&r.id);
            }
            _ => {}
        }
    }

    /// Window expiry: drop conversations that are both terminated and
    /// entirely older than `cutoff`. Stream deltas are a special case — they
    /// may be dropped once stale even mid-stream, since they're pure deltas.
    /// WS message records are the same kind of delta: they may be dropped
    /// once stale even while the conversation is still open, as long as the
    /// `WillOpen`/`Opened` records that anchor it are left alone.
    fn evict_window(&mut self, cutoff: i64) {
        let mut removed_bytes = 0usize;

        self.records.retain(|r| {
            let stale_delta = match r {
                Record::ResponseStreamEvent(e) => e.t_wall_ms < cutoff,
                Record::WebSocketMessageSent(m) => m.t_wall_ms < cutoff,
                Record::WebSocketMessageReceived(m) => m.t_wall_ms < cutoff,
                _ => false,
            };
            if stale_delta {
                removed_bytes += estimate_len(r);
                return false;
            }
            true
        });

        let mut request_has_terminal: HashMap<&str, bool> = HashMap::new();
        let mut request_max_time: HashMap<&str, i64> = HashMap::new();
        let mut ws_max_time: HashMap<&str, i64> = HashMap::new();

        for r in &self.records {
            if r.is_per_request() {
                if let Some(id) = r.conversation_id() {
                    let max = request_max_time.entry(id).or_insert(i64::MIN);
                    *max = (*max).max(r.wall_time_ms());
                    let terminal_here = r.is_request_terminal()
                        && !(matches!(r, Record::ResponseReceived(_))
                            && self.active_response_streams.contains(id));
                    if terminal_here {
                        request_has_terminal.insert(id, true);
                    } else {
                        request_has_terminal.entry(id).or_insert(false);
                    }
                }
            } else if r.is_per_websocket() {
                if let Some(id) = r.conversation_id() {
                    let max = ws_max_time.entry(id).or_insert(i64::MIN);
                    *max = (*max).max(r.wall_time_ms());
                }
            }
        }

        let evictable_requests: HashSet<String> = request_has_terminal
            .into_iter()
            .filter(|(id, has_terminal)| *has_terminal && request_max_time[id] < cutoff)
            .map(|(id, _)| id.to_owned())
            .collect();

        let evictable_ws: HashSet<String> = ws_max_time
            .into_iter()
            .filter(|(id, max_time)| !self.open_websockets.contains(*id) && *max_time < cutoff)
            .map(|(id, _)| id.to_owned())
            .collect();

        self.records.retain(|r| {
            if r.is_per_request() {
                if let Some(id) = r.conversation_id() {
                    if evictable_requests.contains(id) {
                        removed_bytes += estimate_len(r);
                        return false;
                    }
                }
                true
            } else if r.is_per_websocket() {
                if let Some(id) = r.conversation_id() {
                    if evictable_ws.contains(id) {
                        removed_bytes += estimate_len(r);
                        return false;
                    }
                }
                true
            } else if r.wall_time_ms() < cutoff {
                removed_bytes += estimate_len(r);
                false
            } else {
                true
            }
        });

        self.approx_bytes -= removed_bytes;
    }

    /// Cap-driven eviction: drop records, preferring the earliest droppable
    /// one, until under both caps or nothing can be dropped without
    /// breaking an open conversation.
    fn trim_to_caps(&mut self) {
        loop {
            if self.records.len() <= self.max_events && self.approx_bytes <= self.max_bytes {
                return;
            }
            match self.find_droppable() {
                Some(Droppable::Single(idx)) => {
                    let removed = self.records.remove(idx);
                    self.approx_bytes -= estimate_len(&removed);
                }
                Some(Droppable::RequestGroup(id)) => self.remove_request_group(&id),
                Some(Droppable::WebSocketGroup(id)) => self.remove_websocket_group(&id),
                None => return,
            }
        }
    }

    fn find_droppable(&self) -> Option<Droppable> {
        let mut request_has_terminal: HashSet<&str> = HashSet::new();
        for r in &self.records {
            if let Some(id) = r.conversation_id() {
                // A `ResponseReceived` whose id is still an active response
                // stream isn't really terminal yet — matches `evict_window`'s
                // treatment of the same case, so an SSE conversation with
                // headers-received-but-still-streaming never looks droppable.
                let terminal_here = r.is_request_terminal()
                    && !(matches!(r, Record::ResponseReceived(_)) && self.active_response_streams.contains(id));
                if terminal_here {
                    request_has_terminal.insert(id);
                }
            }
        }

        for (idx, r) in self.records.iter().enumerate() {
            match r {
                Record::RequestWillBeSent(req) => {
                    if request_has_terminal.contains(req.id.as_str()) {
                        return Some(Droppable::RequestGroup(req.id.clone()));
                    }
                }
                Record::WebSocketWillOpen(w) => {
                    if !self.open_websockets.contains(&w.id) {
                        return Some(Droppable::WebSocketGroup(w.id.clone()));
                    }
                }
                Record::WebSocketOpened(w) => {
                    if !self.open_websockets.contains(&w.id) {
                        return Some(Droppable::WebSocketGroup(w.id.clone()));
                    }
                }
                _ => return Some(Droppable::Single(idx)),
            }
        }
        None
    }

    fn remove_request_group(&mut self, id: &str) {
        let mut removed_bytes = 0usize;
        self.records.retain(|r| {
            if r.is_per_request() && r.conversation_id() == Some(id) {
                removed_bytes += estimate_len(r);
                false
            } else {
                true
            }
        });
        self.approx_bytes -= removed_bytes;
        self.active_response_streams.remove(id);
    }

    fn remove_websocket_group(&mut self, id: &str) {
        let mut removed_bytes = 0usize;
        self.records.retain(|r| {
            if r.is_per_websocket() && r.conversation_id() == Some(id) {
                removed_bytes += estimate_len(r);
                false
            } else {
                true
            }
        });
        self.approx_bytes -= removed_bytes;
        self.open_websockets.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_protocol::{
        RequestWillBeSent, ResponseReceived, ResponseStreamEvent, WebSocketMessageReceived, WebSocketOpened,
        WebSocketWillOpen,
    };

    fn request_will_be_sent(id: &str, t: i64) -> Record {
        Record::RequestWillBeSent(RequestWillBeSent {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            method: "GET".to_owned(),
            url: "https://example.com".to_owned(),
            headers: vec![],
            body: None,
            encoding: None,
        })
    }

    fn response_received(id: &str, t: i64) -> Record {
        Record::ResponseReceived(ResponseReceived {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            status: 200,
            headers: vec![],
            timings: None,
            body_preview: None,
            body: None,
            encoding: None,
            truncated: None,
            size: None,
        })
    }

    fn ws_will_open(id: &str, t: i64) -> Record {
        Record::WebSocketWillOpen(WebSocketWillOpen {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            url: "wss://example.com".to_owned(),
        })
    }

    fn ws_opened(id: &str, t: i64) -> Record {
        Record::WebSocketOpened(WebSocketOpened {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            headers: vec![],
        })
    }

    fn response_stream_event(id: &str, t: i64) -> Record {
        Record::ResponseStreamEvent(ResponseStreamEvent {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            chunk_preview: "chunk".to_owned(),
            chunk_size: None,
        })
    }

    fn ws_message_received(id: &str, t: i64) -> Record {
        Record::WebSocketMessageReceived(WebSocketMessageReceived {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            preview: "hi".to_owned(),
        })
    }

    #[test]
    fn append_keeps_records_sorted_by_wall_time_with_stable_ties() {
        let mut buf = EventBuffer::new(1_000_000, 100, 1_000_000);
        buf.append(request_will_be_sent("c", 5));
        buf.append(request_will_be_sent("a", 1));
        buf.append(request_will_be_sent("b", 1));

        let snap = buf.snapshot();
        let ids: Vec<&str> = snap.iter().map(|r| r.conversation_id().unwrap()).collect();
        // "a" and "b" share t=1; "a" was inserted after "c" but before "b", so
        // among equal timestamps insertion order ("a" before "b") is kept.
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn approx_bytes_tracks_sum_of_estimator_and_never_goes_negative() {
        let mut buf = EventBuffer::new(1_000_000, 100, 1_000_000);
        assert_eq!(buf.approx_bytes(), 0);
        buf.append(request_will_be_sent("a", 1));
        buf.append(response_received("a", 2));
        let expected: usize = buf.snapshot().iter().map(link_protocol::estimate_len).sum();
        assert_eq!(buf.approx_bytes(), expected);
    }

    #[test]
    fn open_websockets_tracks_presence_without_a_terminal() {
        let mut buf = EventBuffer::new(1_000_000, 100, 1_000_000);
        buf.append(ws_will_open("w1", 1));
        assert!(buf.is_websocket_open("w1"));
        buf.append(ws_opened("w1", 2));
        assert!(buf.is_websocket_open("w1"));
        buf.append(Record::WebSocketClosed(link_protocol::WebSocketClosed {
            id: "w1".to_owned(),
            t_wall_ms: 3,
            t_mono_ns: 3_000_000,
            code: 1000,
            reason: String::new(),
        }));
        assert!(!buf.is_websocket_open("w1"));
    }

    #[test]
    fn window_eviction_leaves_pinned_websocket_conversation_alone() {
        // bufferWindow=5ms, newest t=12: cutoff = 12 - 5 = 7.
        let mut buf = EventBuffer::new(5, 1_000, 1_000_000);
        buf.append(ws_will_open("x", 1));
        buf.append(ws_opened("x", 2));
        for t in 3..=12 {
            buf.append(ws_message_received("x", t));
        }
        assert!(buf.is_websocket_open("x"));
        let snap = buf.snapshot();
        // WillOpen/Opened must survive regardless of their own age.
        assert!(snap.iter().any(|r| matches!(r, Record::WebSocketWillOpen(_))));
        assert!(snap.iter().any(|r| matches!(r, Record::WebSocketOpened(_))));
        // Messages older than the cutoff (7) are gone.
        assert!(snap.iter().all(|r| r.wall_time_ms() >= 7 || matches!(
            r,
            Record::WebSocketWillOpen(_) | Record::WebSocketOpened(_)
        )));
    }

    #[test]
    fn window_eviction_removes_completed_request_conversation() {
        let mut buf = EventBuffer::new(5, 1_000, 1_000_000);
        buf.append(request_will_be_sent("a", 1));
        buf.append(response_received("a", 2));
        // Push the clock far enough that "a"'s conversation falls outside the window.
        buf.append(request_will_be_sent("b", 100));
        let snap = buf.snapshot();
        assert!(snap.iter().all(|r| r.conversation_id() != Some("a")));
    }

    #[test]
    fn cap_eviction_drops_completed_request_before_pinned_one() {
        let mut buf = EventBuffer::new(1_000_000, 4, 1_000_000);
        buf.append(request_will_be_sent("a", 1));
        buf.append(response_received("a", 2));
        buf.append(request_will_be_sent("b", 3));
        buf.append(response_received("b", 4));
        buf.append(request_will_be_sent("c", 5));

        let snap = buf.snapshot();
        assert!(snap.iter().all(|r| r.conversation_id() != Some("a")));
        assert!(snap.iter().any(|r| r.conversation_id() == Some("b")));
        assert!(snap.iter().any(|r| r.conversation_id() == Some("c")));
        assert!(buf.len() <= 4);
    }

    #[test]
    fn cap_eviction_never_treats_an_active_response_stream_as_a_droppable_group() {
        // "a" is an SSE conversation: headers arrived but the stream is
        // still active (no ResponseStreamClosed). Before the id shows up in
        // `active_response_streams` has no bearing on whether the group
        // anchor (`RequestWillBeSent`) is wiped wholesale by
        // `remove_request_group` — it must not be, the way an old bug let
        // `ResponseReceived` alone count as terminal and make the whole
        // group (including the still-active stream) look droppable.
        let mut buf = EventBuffer::new(1_000_000, 3, 1_000_000);
        buf.append(request_will_be_sent("a", 1));
        buf.append(response_received("a", 2));
        buf.append(response_stream_event("a", 3));
        assert!(buf.is_response_stream_active("a"));

        // Cap pressure forces an eviction attempt; it may drop a single
        // non-anchor record, but it must never tear down the whole group.
        buf.append(request_will_be_sent("b", 4));

        assert!(
            buf.is_response_stream_active("a"),
            "an active response stream must survive cap eviction"
        );
        assert!(
            buf.snapshot().iter().any(|r| matches!(r, Record::RequestWillBeSent(req) if req.id == "a")),
            "the anchor record of an active conversation must survive cap eviction"
        );
    }

    #[test]
    fn cap_eviction_may_exceed_cap_when_everything_is_pinned() {
        let mut buf = EventBuffer::new(1_000_000, 1, 1_000_000);
        buf.append(ws_will_open("w1", 1));
        buf.append(ws_will_open("w2", 2));
        assert_eq!(buf.len(), 2);
        assert!(buf.is_websocket_open("w1"));
        assert!(buf.is_websocket_open("w2"));
    }

    #[test]
    fn update_latest_response_body_mutates_the_most_recent_matching_record() {
        let mut buf = EventBuffer::new(1_000_000, 100, 1_000_000);
        buf.append(response_received("a", 1));
        buf.append(response_received("a", 2));
        let updated = buf.update_latest_response_body(
            "a",
            Some("preview".to_owned()),
            Some("Ym9keQ==".to_owned()),
            Some("base64".to_owned()),
            Some(false),
            Some(4),
        );
        assert!(updated);
        let snap = buf.snapshot();
        let matches: Vec<&ResponseReceived> = snap
            .iter()
            .filter_map(|r| match r {
                Record::ResponseReceived(rr) if rr.id == "a" => Some(rr),
                _ => None,
            })
            .collect();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].body.is_none());
        assert_eq!(matches[1].body.as_deref(), Some("Ym9keQ=="));
    }

    #[test]
    fn update_latest_response_body_returns_false_for_unknown_id() {
        let mut buf = EventBuffer::new(1_000_000, 100, 1_000_000);
        assert!(!buf.update_latest_response_body("missing", None, None, None, None, None));
    }
}
