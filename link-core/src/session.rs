//! Per-connection state machine: handshake, dual-priority writer, and
//! host-message reader.
//!
//! A session owns its transport, its writer, and its two priority queues
//! exclusively. It is generic over any `AsyncRead + AsyncWrite + Unpin +
//! Send` transport so the handshake/writer-ordering properties can be
//! exercised over an in-memory `tokio::io::duplex` pair in tests, while the
//! real server drives it over a Unix domain socket.

use crate::config::LinkConfig;
use crate::errors::{HandshakeError, SessionError};
use crate::feature::Feature;
use link_protocol::{decode_host_line, encode_line, AppIcon, Hello, HostMessage, Record, ReplayComplete};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

pub const HELLO_TOKEN: &str = "HelloSnapO";

/// Lifecycle state of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closed = 2,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// Handshake-time context the server supplies to every new session.
#[derive(Debug, Clone)]
pub struct HelloInfo {
    pub package_name: String,
    pub process_name: String,
    pub pid: u32,
    pub server_start_wall_ms: i64,
    pub server_start_mono_ns: i64,
    pub mode: link_protocol::LinkMode,
    pub capabilities: Vec<String>,
    pub app_icon: Option<AppIcon>,
}

/// A single-producer bounded low-priority queue that drops the oldest entry
/// on overflow rather than rejecting the newest. Plain `std::sync::Mutex`
/// since every critical section here is O(1) and never crosses an `.await`.
struct LowQueue {
    capacity: usize,
    items: StdMutex<std::collections::VecDeque<(Instant, Record)>>,
    notify: Notify,
}

impl LowQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: StdMutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Push a record. Returns `true` if the oldest entry was dropped to make
    /// room.
    fn push(&self, record: Record) -> bool {
        let dropped = {
            let mut items = self.items.lock().unwrap();
            let dropped = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back((Instant::now(), record));
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn front_age(&self) -> Option<Duration> {
        self.items.lock().unwrap().front().map(|(t, _)| t.elapsed())
    }

    fn pop(&self) -> Option<Record> {
        self.items.lock().unwrap().pop_front().map(|(_, r)| r)
    }
}

/// A cloneable, cheap-to-hold reference to a running session. `Sink` uses
/// this to gate and enqueue records without owning the session's lifetime.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    state: Arc<AtomicU8>,
    attached: Arc<HashSet<String>>,
    opened: Arc<StdMutex<HashSet<String>>>,
    high_tx: mpsc::Sender<Record>,
    low_queue: Arc<LowQueue>,
    low_dropped: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn is_active(&self) -> bool {
        SessionState::from(self.state.load(Ordering::Acquire)) == SessionState::Active
    }

    pub fn has_opened(&self, feature_id: &str) -> bool {
        self.opened.lock().unwrap().contains(feature_id)
    }

    pub fn has_attached(&self, feature_id: &str) -> bool {
        self.attached.contains(feature_id)
    }

    /// Marks `feature_id` opened for this session. Returns `true` the first
    /// time it's called for a given feature, `false` on every subsequent
    /// call — the caller uses this to make `on_feature_opened` exactly-once.
    fn mark_opened(&self, feature_id: &str) -> bool {
        self.opened.lock().unwrap().insert(feature_id.to_owned())
    }

    pub fn low_dropped(&self) -> u64 {
        self.low_dropped.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Enqueue a high-priority record. Suspends if the channel is full;
    /// never silently drops. If the receiver has already gone away (writer
    /// task exited) the record is dropped and the session is marked closed.
    pub async fn enqueue_high(&self, record: Record) {
        if self.high_tx.send(record).await.is_err() {
            self.set_state(SessionState::Closed);
        }
    }

    /// Enqueue a low-priority record. Never suspends; drops the oldest
    /// queued record on overflow and bumps `low_dropped`.
    pub fn enqueue_low(&self, record: Record) {
        if self.low_queue.push(record) {
            let total = self.low_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 100 == 0 {
                warn!(session_id = self.id, total, "low-priority queue full, dropping oldest record");
            }
        }
    }
}

/// Spawns the task that drives one session end to end: handshake, then a
/// concurrent writer loop and reader loop until either ends or a server
/// shutdown is observed.
pub struct Session;

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<S>(
        stream: S,
        id: u64,
        config: Arc<LinkConfig>,
        registry: Arc<crate::feature::FeatureRegistry>,
        hello_info: HelloInfo,
        sessions: Arc<StdMutex<std::collections::HashMap<u64, SessionHandle>>>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            run_session(stream, id, config, registry.clone(), hello_info, sessions.clone(), shutdown).await;
            sessions.lock().unwrap().remove(&id);
        })
    }
}

async fn read_hello_line<R: AsyncRead + Unpin>(reader: &mut R, max_bytes: usize) -> Result<String, HandshakeError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before hello line",
            )));
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > max_bytes {
            return Err(HandshakeError::TooLarge(max_bytes));
        }
    }
    String::from_utf8(buf)
        .map_err(|e| HandshakeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

async fn send_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &Record) -> Result<(), SessionError> {
    let line = encode_line(record);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_session<S>(
    stream: S,
    id: u64,
    config: Arc<LinkConfig>,
    registry: Arc<crate::feature::FeatureRegistry>,
    hello_info: HelloInfo,
    sessions: Arc<StdMutex<std::collections::HashMap<u64, SessionHandle>>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let handshake = tokio::time::timeout(
        config.client_hello_timeout,
        read_hello_line(&mut read_half, config.client_hello_max_bytes),
    )
    .await;

    let line = match handshake {
        Err(_) => {
            let err = HandshakeError::Timeout;
            warn!(session_id = id, reason = %err, "rejecting connection");
            return;
        }
        Ok(Err(e)) => {
            warn!(session_id = id, reason = %e, "rejecting connection");
            return;
        }
        Ok(Ok(line)) => line,
    };

    if line.trim_end() != HELLO_TOKEN {
        let err = HandshakeError::UnexpectedToken(line);
        warn!(session_id = id, reason = %err, "rejecting connection");
        return;
    }

    let hello = Hello {
        schema_version: "1.0".to_owned(),
        package_name: hello_info.package_name.clone(),
        process_name: hello_info.process_name.clone(),
        pid: hello_info.pid,
        server_start_wall_ms: hello_info.server_start_wall_ms,
        server_start_mono_ns: hello_info.server_start_mono_ns,
        mode: hello_info.mode,
        capabilities: hello_info.capabilities.clone(),
    };

    if send_record(&mut write_half, &Record::Hello(hello)).await.is_err() {
        return;
    }
    if let Some(icon) = hello_info.app_icon.clone() {
        if send_record(&mut write_half, &Record::AppIcon(icon)).await.is_err() {
            return;
        }
    }

    let attached_ids = registry.attached_ids();
    let attached: HashSet<String> = attached_ids.iter().cloned().collect();
    let (high_tx, mut high_rx) = mpsc::channel::<Record>(config.high_priority_queue_capacity);
    let low_queue = Arc::new(LowQueue::new(config.low_priority_queue_capacity));

    let handle = SessionHandle {
        id,
        state: Arc::new(AtomicU8::new(SessionState::Connecting as u8)),
        attached: Arc::new(attached),
        opened: Arc::new(StdMutex::new(HashSet::new())),
        high_tx,
        low_queue: low_queue.clone(),
        low_dropped: Arc::new(AtomicU64::new(0)),
    };
    handle.set_state(SessionState::Active);
    sessions.lock().unwrap().insert(id, handle.clone());
    info!(session_id = id, features = ?attached_ids, "session active");

    // `ReplayComplete` always goes through the high queue so it's ordered
    // after any pre-replay envelopes a feature enqueues synchronously from
    // within `on_link_available`-driven state, and before live traffic.
    handle.enqueue_high(Record::ReplayComplete(ReplayComplete {})).await;

    let last_high_emit = Arc::new(StdMutex::new(Instant::now()));
    let writer_config = config.clone();
    let writer_last_emit = last_high_emit.clone();
    let mut writer_shutdown = shutdown.clone();
    let writer_fut = async move {
        writer_loop(write_half, &mut high_rx, &low_queue, &writer_config, &writer_last_emit, &mut writer_shutdown).await
    };

    let reader_registry = registry.clone();
    let reader_handle = handle.clone();
    let mut reader_shutdown = shutdown.clone();
    let reader_fut = async move { reader_loop(read_half, &reader_registry, &reader_handle, &mut reader_shutdown).await };

    tokio::select! {
        biased;
        _ = shutdown.changed() => {}
        _ = writer_fut => {}
        _ = reader_fut => {}
    }

    handle.set_state(SessionState::Closed);
    for feature_id in attached_ids {
        if let Some(feature) = registry.get(&feature_id) {
            feature.on_client_disconnected(id);
        }
    }
    info!(session_id = id, "session closed");
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    high_rx: &mut mpsc::Receiver<Record>,
    low_queue: &LowQueue,
    config: &LinkConfig,
    last_high_emit: &StdMutex<Instant>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Ok(record) = high_rx.try_recv() {
            if send_record(&mut writer, &record).await.is_err() {
                return;
            }
            *last_high_emit.lock().unwrap() = Instant::now();
            continue;
        }

        if let Some(age) = low_queue.front_age() {
            let idle = last_high_emit.lock().unwrap().elapsed();
            if idle < config.high_priority_idle_threshold && age < config.max_low_priority_defer {
                // Cap the retry tick to however much of the defer budget is
                // left, not the full retry delay, so the next wake-up lands
                // exactly at the deadline instead of up to a full
                // `lowPriorityRetryDelayMillis` past it.
                let remaining = config.max_low_priority_defer.saturating_sub(age);
                let retry_delay = config.low_priority_retry_delay.min(remaining);
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                    maybe = high_rx.recv() => {
                        match maybe {
                            Some(record) => {
                                if send_record(&mut writer, &record).await.is_err() { return; }
                                *last_high_emit.lock().unwrap() = Instant::now();
                            }
                            None => return,
                        }
                    }
                    () = tokio::time::sleep(retry_delay) => {}
                }
                continue;
            }
            if let Some(record) = low_queue.pop() {
                if send_record(&mut writer, &record).await.is_err() {
                    return;
                }
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            maybe = high_rx.recv() => {
                match maybe {
                    Some(record) => {
                        if send_record(&mut writer, &record).await.is_err() { return; }
                        *last_high_emit.lock().unwrap() = Instant::now();
                    }
                    None => return,
                }
            }
            () = low_queue.notify.notified() => {}
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    read_half: R,
    registry: &crate::feature::FeatureRegistry,
    handle: &SessionHandle,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => { debug!(session_id = handle.id, error = %e, "reader I/O error"); return; }
                };
                dispatch_host_line(&line, registry, handle);
            }
        }
    }
}

fn dispatch_host_line(line: &str, registry: &crate::feature::FeatureRegistry, handle: &SessionHandle) {
    match decode_host_line(line) {
        Ok(HostMessage::FeatureOpened { feature }) => {
            if handle.has_attached(&feature) && handle.mark_opened(&feature) {
                if let Some(f) = registry.get(&feature) {
                    f.on_feature_opened(handle.id);
                }
            }
        }
        Ok(HostMessage::FeatureCommand { feature, payload }) => {
            if handle.has_attached(&feature) {
                if let Some(f) = registry.get(&feature) {
                    f.on_feature_command(handle.id, payload);
                }
            }
        }
        Ok(HostMessage::Unrecognized) => {
            debug!(session_id = handle.id, "ignoring unrecognized host message");
        }
        Err(e) => {
            debug!(session_id = handle.id, error = %e, "ignoring malformed host message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureRegistry;
    use link_protocol::{decode_line, LinkMode};
    use std::collections::HashMap;

    fn test_config() -> Arc<LinkConfig> {
        Arc::new(LinkConfig::default())
    }

    fn hello_info() -> HelloInfo {
        HelloInfo {
            package_name: "com.example.app".to_owned(),
            process_name: "com.example.app".to_owned(),
            pid: 1234,
            server_start_wall_ms: 1_700_000_000_000,
            server_start_mono_ns: 0,
            mode: LinkMode::Safe,
            capabilities: vec!["network".to_owned()],
            app_icon: None,
        }
    }

    async fn read_line(stream: &mut (impl AsyncRead + Unpin)) -> String {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn handshake_ok_writes_hello_then_replay_complete() {
        let (mut client, server) = tokio::io::duplex(4096);
        let sessions = Arc::new(StdMutex::new(HashMap::new()));
        let registry = Arc::new(FeatureRegistry::new(sessions.clone()));
        registry.start();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = Session::spawn(server, 1, test_config(), registry, hello_info(), sessions, shutdown_rx);

        client.write_all(b"HelloSnapO\n").await.unwrap();

        let hello_line = read_line(&mut client).await;
        let hello = decode_line(hello_line.trim_end()).unwrap();
        assert!(matches!(hello, Record::Hello(_)));

        let replay_line = read_line(&mut client).await;
        let replay = decode_line(replay_line.trim_end()).unwrap();
        assert!(matches!(replay, Record::ReplayComplete(_)));

        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }

    #[tokio::test]
    async fn wrong_handshake_token_closes_without_writing_anything() {
        let (mut client, server) = tokio::io::duplex(4096);
        let sessions = Arc::new(StdMutex::new(HashMap::new()));
        let registry = Arc::new(FeatureRegistry::new(sessions.clone()));
        registry.start();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = Session::spawn(server, 1, test_config(), registry, hello_info(), sessions, shutdown_rx);
        client.write_all(b"HelloOther\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_millis(500), client.read(&mut buf))
            .await
            .expect("read should not hang")
            .unwrap();
        assert_eq!(n, 0, "server must write nothing and close");

        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }

    #[tokio::test]
    async fn high_priority_records_are_delivered_in_enqueue_order() {
        let (mut client, server) = tokio::io::duplex(8192);
        let sessions = Arc::new(StdMutex::new(HashMap::new()));
        let registry = Arc::new(FeatureRegistry::new(sessions.clone()));
        registry.start();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let _join = Session::spawn(server, 1, test_config(), registry, hello_info(), sessions.clone(), shutdown_rx);
        client.write_all(b"HelloSnapO\n").await.unwrap();
        let _ = read_line(&mut client).await; // Hello
        let _ = read_line(&mut client).await; // ReplayComplete

        let handle = sessions.lock().unwrap().get(&1).cloned().unwrap();
        for i in 0..5 {
            handle
                .enqueue_high(Record::RequestFailed(link_protocol::RequestFailed {
                    id: i.to_string(),
                    t_wall_ms: i,
                    t_mono_ns: i,
                    error: "e".to_owned(),
                }))
                .await;
        }

        for i in 0..5 {
            let line = read_line(&mut client).await;
            let record = decode_line(line.trim_end()).unwrap();
            match record {
                Record::RequestFailed(r) => assert_eq!(r.id, i.to_string()),
                other => panic!("unexpected record: {other:?}"),
            }
        }
    }
}
