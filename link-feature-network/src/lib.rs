//! The `network` feature: buffered, replay-on-open network records with
//! deferred response bodies.
//!
//! Holds the process's single [`EventBuffer`](link_core::EventBuffer) and
//! exposes [`NetworkFeature::publish`] for instrumentation to call as HTTP
//! requests, SSE streams, and WebSockets produce records. Concrete record
//! shapes live in `link-protocol`; this crate only knows how to buffer,
//! broadcast, and replay them.

use link_core::{ClientId, Feature, LinkConfig, Priority, Sink};
use link_protocol::{FeatureEvent, Record, ResponseReceived};
use serde::Deserialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::debug;

pub const FEATURE_ID: &str = "network";

/// The concrete `network` feature. Construct with [`NetworkFeature::new`]
/// and register the returned `Arc` with a [`link_core::FeatureRegistry`].
pub struct NetworkFeature {
    buffer: StdMutex<link_core::EventBuffer>,
    sink: StdMutex<Option<Sink>>,
    response_body_delay: Duration,
    response_body_stagger: Duration,
}

impl NetworkFeature {
    pub fn new(config: &LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            buffer: StdMutex::new(link_core::EventBuffer::new(
                i64::try_from(config.buffer_window.as_millis()).unwrap_or(i64::MAX),
                config.max_buffered_events,
                config.max_buffered_bytes,
            )),
            sink: StdMutex::new(None),
            response_body_delay: config.response_body_delay,
            response_body_stagger: config.response_body_stagger,
        })
    }

    /// Publish a record: buffer it, then broadcast it to every session that
    /// has opened `network`. `ResponseReceived` records carrying a body are
    /// split into an immediate header-only emission and a body-bearing
    /// emission deferred by `responseBodyDelayMillis`.
    pub async fn publish(self: &Arc<Self>, record: Record) {
        self.buffer.lock().unwrap().append(record.clone());

        let sink = self.sink.lock().unwrap().clone();
        let Some(sink) = sink else {
            return;
        };

        match split_body(&record) {
            Some((header_only, full)) => {
                sink.send(envelope(&header_only), ClientId::All, Priority::High).await;
                let feature = Arc::clone(self);
                let delay = self.response_body_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    feature.send_if_linked(envelope(&full), ClientId::All, Priority::Low).await;
                });
            }
            None => {
                sink.send(envelope(&record), ClientId::All, Priority::High).await;
            }
        }
    }

    /// Attach body information to the most recent `ResponseReceived` for
    /// `request_id`, then publish that updated record the same way a fresh
    /// `ResponseReceived` would be: if the attached body is non-empty, the
    /// header-only half was already sent by the earlier `publish`, so only
    /// the deferred body needs to go out now.
    pub async fn attach_response_body(
        self: &Arc<Self>,
        request_id: &str,
        body_preview: Option<String>,
        body: Option<String>,
        encoding: Option<String>,
        truncated: Option<bool>,
        size: Option<u64>,
    ) {
        let updated = {
            let mut buffer = self.buffer.lock().unwrap();
            if !buffer.update_latest_response_body(request_id, body_preview, body, encoding, truncated, size) {
                return;
            }
            buffer
                .snapshot()
                .into_iter()
                .rev()
                .find(|r| matches!(r, Record::ResponseReceived(rr) if rr.id == request_id))
        };
        let Some(record) = updated else { return };
        let Record::ResponseReceived(rr) = &record else { return };
        if !rr.has_body() {
            return;
        }
        let feature = Arc::clone(self);
        let delay = self.response_body_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            feature.send_if_linked(envelope(&record), ClientId::All, Priority::Low).await;
        });
    }

    async fn send_if_linked(&self, record: Record, client: ClientId, priority: Priority) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.send(record, client, priority).await;
        }
    }

    fn resolve_request_post_data(&self, request_id: &str) -> Option<(Option<String>, Option<String>)> {
        self.buffer.lock().unwrap().snapshot().into_iter().rev().find_map(|r| match r {
            Record::RequestWillBeSent(req) if req.id == request_id => Some((req.body, req.encoding)),
            _ => None,
        })
    }

    fn resolve_response_body(&self, request_id: &str) -> Option<ResponseReceived> {
        self.buffer.lock().unwrap().snapshot().into_iter().rev().find_map(|r| match r {
            Record::ResponseReceived(rr) if rr.id == request_id => Some(rr),
            _ => None,
        })
    }
}

/// If `record` is a `ResponseReceived` carrying a body, returns
/// `(header_only, original)`; otherwise `None`.
fn split_body(record: &Record) -> Option<(Record, Record)> {
    match record {
        Record::ResponseReceived(rr) if rr.has_body() => {
            Some((Record::ResponseReceived(rr.without_body()), record.clone()))
        }
        _ => None,
    }
}

fn envelope(record: &Record) -> Record {
    Record::FeatureEvent(FeatureEvent {
        feature: FEATURE_ID.to_owned(),
        payload: serde_json::to_value(record).expect("Record always serializes"),
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
enum NetworkCommand {
    GetRequestPostData {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    GetResponseBody {
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

impl Feature for NetworkFeature {
    fn feature_id(&self) -> &str {
        FEATURE_ID
    }

    fn on_link_available(&self, sink: Sink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn on_feature_opened(&self, client: u64) {
        let sink = self.sink.lock().unwrap().clone();
        let Some(sink) = sink else { return };
        let snapshot = self.buffer.lock().unwrap().snapshot();
        let delay = self.response_body_delay;
        let stagger = self.response_body_stagger;

        tokio::spawn(async move {
            let mut deferred = Vec::new();
            for record in snapshot {
                match split_body(&record) {
                    Some((header_only, full)) => {
                        sink.send(envelope(&header_only), ClientId::Specific(client), Priority::High).await;
                        deferred.push(full);
                    }
                    None => {
                        sink.send(envelope(&record), ClientId::Specific(client), Priority::High).await;
                    }
                }
            }
            // Each iteration sleeps only the *incremental* gap since the
            // previous send, so the total elapsed time per record is an
            // absolute `delay + stagger * index` from the moment the feature
            // was opened, not a cumulative sum of per-record waits.
            for (index, record) in deferred.into_iter().enumerate() {
                let wait = if index == 0 { delay } else { stagger };
                tokio::time::sleep(wait).await;
                sink.send(envelope(&record), ClientId::Specific(client), Priority::Low).await;
            }
        });
    }

    fn on_feature_command(&self, client: u64, payload: serde_json::Value) {
        let command: Result<NetworkCommand, _> = serde_json::from_value(payload);
        let sink = self.sink.lock().unwrap().clone();
        let Some(sink) = sink else { return };

        match command {
            Ok(NetworkCommand::GetRequestPostData { request_id }) => {
                let resolved = self.resolve_request_post_data(&request_id);
                let reply = match resolved {
                    Some((body, encoding)) => serde_json::json!({
                        "type": "RequestPostData",
                        "requestId": request_id,
                        "body": body,
                        "encoding": encoding,
                    }),
                    None => error_reply(&request_id, "no request post data captured for this id"),
                };
                spawn_reply(sink, client, reply);
            }
            Ok(NetworkCommand::GetResponseBody { request_id }) => {
                let resolved = self.resolve_response_body(&request_id);
                let reply = match resolved {
                    Some(rr) => serde_json::json!({
                        "type": "ResponseBody",
                        "requestId": request_id,
                        "body": rr.body,
                        "encoding": rr.encoding,
                        "truncated": rr.truncated,
                        "size": rr.size,
                    }),
                    None => error_reply(&request_id, "no response body captured for this id"),
                };
                spawn_reply(sink, client, reply);
            }
            Err(e) => {
                debug!(client, error = %e, "unrecognized network feature command");
            }
        }
    }

    fn on_client_disconnected(&self, _client: u64) {}
}

fn error_reply(request_id: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "Error",
        "requestId": request_id,
        "message": message,
    })
}

fn spawn_reply(sink: Sink, client: u64, payload: serde_json::Value) {
    tokio::spawn(async move {
        sink.send(
            Record::FeatureEvent(FeatureEvent {
                feature: FEATURE_ID.to_owned(),
                payload,
            }),
            ClientId::Specific(client),
            Priority::High,
        )
        .await;
    });
}
