// link-protocol: wire types and line-delimited JSON codec for the on-device
// observability link.
//
// Every record serializes to exactly one UTF-8 line tagged by its `type`
// field (or `kind` for the host-originated `HostMessage` namespace). Decoders
// must never fail on unrecognized tags or unknown optional fields — callers
// that don't understand a record just skip it.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// One HTTP header, preserving duplicates and original casing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

/// Optional per-phase timing breakdown for a completed request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handshake records
// ---------------------------------------------------------------------------

/// First record the server writes after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub schema_version: String,
    pub package_name: String,
    pub process_name: String,
    pub pid: u32,
    pub server_start_wall_ms: i64,
    pub server_start_mono_ns: i64,
    pub mode: LinkMode,
    pub capabilities: Vec<String>,
}

/// Safe mode redacts request/response bodies at the instrumentation layer;
/// unredacted mode does not. The core treats this as an opaque label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    Safe,
    Unredacted,
}

/// Optional app-icon handshake payload, sent once right after `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIcon {
    pub pkg: String,
    pub w: u32,
    pub h: u32,
    pub format: String,
    pub base64: String,
}

/// Marker delimiting pre-live snapshot replay from live streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayComplete {}

// ---------------------------------------------------------------------------
// Per-request records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSent {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<HeaderPair>,
    /// Request body, captured opaquely (same encoding convention as
    /// `ResponseReceived::body`); absent when the instrumentation layer
    /// didn't capture a post body for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceived {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<HeaderPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ResponseReceived {
    /// True when this record currently carries body bytes worth deferring.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Header-only copy for the high-priority emission; strips both
    /// `bodyPreview` and `body` per the network feature's deferral contract.
    pub fn without_body(&self) -> Self {
        Self {
            body_preview: None,
            body: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFailed {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStreamEvent {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub chunk_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStreamClosed {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
}

// ---------------------------------------------------------------------------
// Per-websocket records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketWillOpen {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketOpened {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    #[serde(default)]
    pub headers: Vec<HeaderPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketMessageSent {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketMessageReceived {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosing {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosed {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFailed {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketCloseRequested {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketCancelled {
    pub id: String,
    pub t_wall_ms: i64,
    pub t_mono_ns: i64,
}

// ---------------------------------------------------------------------------
// Feature envelope
// ---------------------------------------------------------------------------

/// Wraps a feature-specific JSON payload for transport over the shared line
/// protocol. The payload structure is owned entirely by the feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvent {
    pub feature: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union (server -> client)
// ---------------------------------------------------------------------------

/// Every record the server can write to a client, one per line.
///
/// Serializes using the `type` field as a tag, e.g. `{"type":"Hello",...}`.
/// Decoding an unrecognized `type` yields [`Record::Unrecognized`] rather
/// than an error, so forward-compatible readers never choke on a new variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    Hello(Hello),
    AppIcon(AppIcon),
    ReplayComplete(ReplayComplete),
    RequestWillBeSent(RequestWillBeSent),
    ResponseReceived(ResponseReceived),
    RequestFailed(RequestFailed),
    ResponseStreamEvent(ResponseStreamEvent),
    ResponseStreamClosed(ResponseStreamClosed),
    WebSocketWillOpen(WebSocketWillOpen),
    WebSocketOpened(WebSocketOpened),
    WebSocketMessageSent(WebSocketMessageSent),
    WebSocketMessageReceived(WebSocketMessageReceived),
    WebSocketClosing(WebSocketClosing),
    WebSocketClosed(WebSocketClosed),
    WebSocketFailed(WebSocketFailed),
    WebSocketCloseRequested(WebSocketCloseRequested),
    WebSocketCancelled(WebSocketCancelled),
    FeatureEvent(FeatureEvent),
    /// Catch-all for tags this build doesn't know about yet. Never produced
    /// by `Record::encode`; only ever the result of decoding a line whose
    /// `type` didn't match any known variant.
    #[serde(other)]
    Unrecognized,
}

impl Record {
    /// The request/websocket id this record belongs to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Record::RequestWillBeSent(r) => Some(&r.id),
            Record::ResponseReceived(r) => Some(&r.id),
            Record::RequestFailed(r) => Some(&r.id),
            Record::ResponseStreamEvent(r) => Some(&r.id),
            Record::ResponseStreamClosed(r) => Some(&r.id),
            Record::WebSocketWillOpen(r) => Some(&r.id),
            Record::WebSocketOpened(r) => Some(&r.id),
            Record::WebSocketMessageSent(r) => Some(&r.id),
            Record::WebSocketMessageReceived(r) => Some(&r.id),
            Record::WebSocketClosing(r) => Some(&r.id),
            Record::WebSocketClosed(r) => Some(&r.id),
            Record::WebSocketFailed(r) => Some(&r.id),
            Record::WebSocketCloseRequested(r) => Some(&r.id),
            Record::WebSocketCancelled(r) => Some(&r.id),
            _ => None,
        }
    }

    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            Record::RequestWillBeSent(_)
                | Record::ResponseReceived(_)
                | Record::RequestFailed(_)
                | Record::ResponseStreamEvent(_)
                | Record::ResponseStreamClosed(_)
        )
    }

    pub fn is_per_websocket(&self) -> bool {
        matches!(
            self,
            Record::WebSocketWillOpen(_)
                | Record::WebSocketOpened(_)
                | Record::WebSocketMessageSent(_)
                | Record::WebSocketMessageReceived(_)
                | Record::WebSocketClosing(_)
                | Record::WebSocketClosed(_)
                | Record::WebSocketFailed(_)
                | Record::WebSocketCloseRequested(_)
                | Record::WebSocketCancelled(_)
        )
    }

    /// True if this record is a `RequestWillBeSent`/`ResponseReceived`/
    /// `RequestFailed`/`ResponseStreamClosed` that ends a request
    /// conversation, i.e. nothing later for the same id is expected except
    /// possibly stream deltas for an id outside `activeResponseStreams`.
    pub fn is_request_terminal(&self) -> bool {
        matches!(
            self,
            Record::ResponseReceived(_) | Record::RequestFailed(_) | Record::ResponseStreamClosed(_)
        )
    }

    /// True if this record ends a websocket conversation.
    pub fn is_websocket_terminal(&self) -> bool {
        matches!(
            self,
            Record::WebSocketClosed(_) | Record::WebSocketFailed(_) | Record::WebSocketCancelled(_)
        )
    }

    /// Monotonically-ordered wall time for buffer insertion. Records with no
    /// natural wall time (there are none among the variants above, but the
    /// catch-all needs a value) sort as `+inf`, i.e. always last.
    pub fn wall_time_ms(&self) -> i64 {
        match self {
            Record::RequestWillBeSent(r) => r.t_wall_ms,
            Record::ResponseReceived(r) => r.t_wall_ms,
            Record::RequestFailed(r) => r.t_wall_ms,
            Record::ResponseStreamEvent(r) => r.t_wall_ms,
            Record::ResponseStreamClosed(r) => r.t_wall_ms,
            Record::WebSocketWillOpen(r) => r.t_wall_ms,
            Record::WebSocketOpened(r) => r.t_wall_ms,
            Record::WebSocketMessageSent(r) => r.t_wall_ms,
            Record::WebSocketMessageReceived(r) => r.t_wall_ms,
            Record::WebSocketClosing(r) => r.t_wall_ms,
            Record::WebSocketClosed(r) => r.t_wall_ms,
            Record::WebSocketFailed(r) => r.t_wall_ms,
            Record::WebSocketCloseRequested(r) => r.t_wall_ms,
            Record::WebSocketCancelled(r) => r.t_wall_ms,
            Record::Hello(_)
            | Record::AppIcon(_)
            | Record::ReplayComplete(_)
            | Record::FeatureEvent(_)
            | Record::Unrecognized => i64::MAX,
        }
    }
}

// ---------------------------------------------------------------------------
// Host -> device messages
// ---------------------------------------------------------------------------

/// Messages the client may send after the handshake completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    FeatureOpened { feature: String },
    FeatureCommand { feature: String, payload: serde_json::Value },
    /// Unknown host message kinds are parsed into this variant and ignored
    /// by the reader loop rather than rejected.
    #[serde(other)]
    Unrecognized,
}

// ---------------------------------------------------------------------------
// Wire codec
// ---------------------------------------------------------------------------

/// Errors raised only for structurally broken lines — not for unknown tags
/// or unknown optional fields, which decode successfully into `Unrecognized`
/// or are silently dropped by serde's `#[serde(default)]`.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a record to a single line, terminated by `\n`. Never panics;
/// `Record`'s fields are all JSON-representable by construction.
pub fn encode_line(record: &Record) -> String {
    let mut line = serde_json::to_string(record).expect("Record always serializes");
    line.push('\n');
    line
}

/// Encode a `HostMessage` to a single line, terminated by `\n`.
pub fn encode_host_line(message: &HostMessage) -> String {
    let mut line = serde_json::to_string(message).expect("HostMessage always serializes");
    line.push('\n');
    line
}

/// Decode one line (without its trailing newline) into a `Record`.
///
/// Unknown `type` tags decode to `Record::Unrecognized` rather than
/// erroring; only malformed JSON is an error.
pub fn decode_line(line: &str) -> Result<Record, CodecError> {
    Ok(serde_json::from_str(line)?)
}

/// Decode one line into a `HostMessage`. See [`decode_line`] for the
/// unknown-tag tolerance contract.
pub fn decode_host_line(line: &str) -> Result<HostMessage, CodecError> {
    Ok(serde_json::from_str(line)?)
}

/// O(1)-ish approximation of a record's encoded line length, used by the
/// event buffer's byte-budget accounting. Stable across repeated calls for
/// the same record, cheap enough to call on every insert/evict.
///
/// This is an estimate, not `encode_line(r).len()`, so it never allocates a
/// full JSON string just to measure it; body/preview fields (the only
/// unbounded parts of a record) are measured directly since they dominate
/// the size, and everything else is charged a fixed per-record overhead.
pub fn estimate_len(record: &Record) -> usize {
    const BASE_OVERHEAD: usize = 96;

    let variable = match record {
        Record::ResponseReceived(r) => {
            r.headers.iter().map(header_len).sum::<usize>()
                + r.body_preview.as_deref().map_or(0, str::len)
                + r.body.as_deref().map_or(0, str::len)
        }
        Record::RequestWillBeSent(r) => {
            r.url.len() + r.headers.iter().map(header_len).sum::<usize>() + r.body.as_deref().map_or(0, str::len)
        }
        Record::WebSocketOpened(r) => r.headers.iter().map(header_len).sum::<usize>(),
        Record::WebSocketMessageSent(r) => r.preview.len(),
        Record::WebSocketMessageReceived(r) => r.preview.len(),
        Record::ResponseStreamEvent(r) => r.chunk_preview.len(),
        Record::RequestFailed(r) => r.error.len(),
        Record::WebSocketFailed(r) => r.error.len(),
        Record::AppIcon(a) => a.base64.len(),
        Record::FeatureEvent(f) => f.payload.to_string().len(),
        _ => 0,
    };

    BASE_OVERHEAD + variable
}

fn header_len(h: &HeaderPair) -> usize {
    h.name.len() + h.value.len() + 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(id: &str, t: i64) -> Record {
        Record::RequestWillBeSent(RequestWillBeSent {
            id: id.to_owned(),
            t_wall_ms: t,
            t_mono_ns: t * 1_000_000,
            method: "GET".to_owned(),
            url: "https://example.com".to_owned(),
            headers: vec![HeaderPair {
                name: "Accept".to_owned(),
                value: "*/*".to_owned(),
            }],
            body: None,
            encoding: None,
        })
    }

    #[test]
    fn round_trips_through_the_line_codec() {
        let record = sample_request("r1", 1_000);
        let line = encode_line(&record);
        assert!(line.ends_with('\n'));
        let decoded = decode_line(line.trim_end_matches('\n')).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_type_tag_decodes_to_unrecognized_not_an_error() {
        let decoded = decode_line(r#"{"type":"SomethingFromTheFuture","foo":1}"#).unwrap();
        assert_eq!(decoded, Record::Unrecognized);
    }

    #[test]
    fn unknown_optional_fields_are_tolerated() {
        let decoded = decode_line(
            r#"{"type":"RequestWillBeSent","id":"r1","tWallMs":1,"tMonoNs":2,"method":"GET","url":"u","headers":[],"extraFutureField":"ignored"}"#,
        )
        .unwrap();
        assert!(matches!(decoded, Record::RequestWillBeSent(_)));
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let err = decode_line("{not json");
        assert!(err.is_err());
    }

    #[test]
    fn encoding_omits_none_fields() {
        let record = Record::ResponseReceived(ResponseReceived {
            id: "r1".to_owned(),
            t_wall_ms: 1,
            t_mono_ns: 2,
            status: 200,
            headers: vec![],
            timings: None,
            body_preview: None,
            body: None,
            encoding: None,
            truncated: None,
            size: None,
        });
        let line = encode_line(&record);
        assert!(!line.contains("body"));
        assert!(!line.contains("timings"));
    }

    #[test]
    fn response_received_without_body_strips_body_and_preview_only() {
        let full = ResponseReceived {
            id: "r1".to_owned(),
            t_wall_ms: 1,
            t_mono_ns: 2,
            status: 200,
            headers: vec![],
            timings: None,
            body_preview: Some("hello".to_owned()),
            body: Some("aGVsbG8=".to_owned()),
            encoding: Some("base64".to_owned()),
            truncated: Some(false),
            size: Some(5),
        };
        let stripped = full.without_body();
        assert!(stripped.body_preview.is_none());
        assert!(stripped.body.is_none());
        assert_eq!(stripped.encoding, full.encoding);
        assert_eq!(stripped.size, full.size);
    }

    #[test]
    fn estimate_len_grows_with_body_size_and_is_stable() {
        let small = Record::ResponseReceived(ResponseReceived {
            id: "r1".to_owned(),
            t_wall_ms: 1,
            t_mono_ns: 2,
            status: 200,
            headers: vec![],
            timings: None,
            body_preview: None,
            body: Some("x".repeat(10)),
            encoding: None,
            truncated: None,
            size: None,
        });
        let big = Record::ResponseReceived(ResponseReceived {
            id: "r1".to_owned(),
            t_wall_ms: 1,
            t_mono_ns: 2,
            status: 200,
            headers: vec![],
            timings: None,
            body_preview: None,
            body: Some("x".repeat(10_000)),
            encoding: None,
            truncated: None,
            size: None,
        });
        assert!(estimate_len(&big) > estimate_len(&small));
        assert_eq!(estimate_len(&small), estimate_len(&small));
    }

    #[test]
    fn per_request_and_per_websocket_classification_are_disjoint() {
        let req = sample_request("r1", 1);
        assert!(req.is_per_request());
        assert!(!req.is_per_websocket());

        let ws = Record::WebSocketOpened(WebSocketOpened {
            id: "w1".to_owned(),
            t_wall_ms: 1,
            t_mono_ns: 2,
            headers: vec![],
        });
        assert!(ws.is_per_websocket());
        assert!(!ws.is_per_request());
    }

    #[test]
    fn untimed_records_sort_after_everything_else() {
        assert_eq!(Record::ReplayComplete(ReplayComplete {}).wall_time_ms(), i64::MAX);
        assert_eq!(sample_request("r1", 42).wall_time_ms(), 42);
    }
}
