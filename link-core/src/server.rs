//! Accept loop, session bookkeeping, and the release-build startup guard.

use crate::config::LinkConfig;
use crate::errors::ServerError;
use crate::feature::FeatureRegistry;
use crate::session::{HelloInfo, Session, SessionHandle};
use link_protocol::{AppIcon, LinkMode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Process identity handed to every session's handshake as `Hello` fields.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub package_name: String,
    pub process_name: String,
    pub mode: LinkMode,
    pub capabilities: Vec<String>,
    pub app_icon: Option<AppIcon>,
}

/// The embedded observability link server. Owns every session and the
/// feature registry for the process.
pub struct Server {
    config: Arc<LinkConfig>,
    registry: Arc<FeatureRegistry>,
    sessions: Arc<StdMutex<HashMap<u64, SessionHandle>>>,
    next_id: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    socket_name: String,
}

impl Server {
    /// Binds the link socket and starts accepting connections. Refuses to
    /// start in a release build (`cfg!(debug_assertions)` is `false`)
    /// unless `config.allow_release` is set.
    pub fn bind(
        config: LinkConfig,
        host_info: HostInfo,
        registry: Arc<FeatureRegistry>,
        pid: u32,
    ) -> Result<Self, ServerError> {
        if !cfg!(debug_assertions) && !config.allow_release {
            error!("refusing to start observability link: release build without allow_release");
            return Err(ServerError::ReleaseBuildBlocked);
        }

        let config = Arc::new(config);
        let socket_name = format!("{}_{pid}", config.socket_name_prefix);
        let listener = bind_listener(&socket_name).map_err(ServerError::Bind)?;
        info!(socket_name = %socket_name, "observability link listening");

        // Share the registry's own session table rather than keeping a
        // second one: a `Sink` built from `registry` only ever resolves
        // sessions through that exact map.
        let sessions = registry.sessions();
        registry.start();

        let server_start_wall_ms = now_wall_ms();
        let server_start_mono = Instant::now();
        let next_id = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_config = config.clone();
        let accept_registry = registry.clone();
        let accept_sessions = sessions.clone();
        let accept_next_id = next_id.clone();
        let accept_host_info = host_info;
        let accept_shutdown_rx = shutdown_rx;
        let accept_task = tokio::spawn(async move {
            accept_loop(
                listener,
                accept_config,
                accept_registry,
                accept_sessions,
                accept_next_id,
                accept_host_info,
                pid,
                server_start_wall_ms,
                server_start_mono,
                accept_shutdown_rx,
            )
            .await;
        });

        Ok(Self {
            config,
            registry,
            sessions,
            next_id,
            shutdown_tx,
            accept_task: Some(accept_task),
            socket_name,
        })
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
    }

    /// Cancels the accept task, closes every session, and tears down the
    /// socket. Idempotent.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        // Sessions observe the shutdown signal in their own select loops and
        // unregister themselves; give the runtime a chance to drain them.
        for _ in 0..50 {
            if self.sessions.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: UnixListener,
    config: Arc<LinkConfig>,
    registry: Arc<FeatureRegistry>,
    sessions: Arc<StdMutex<HashMap<u64, SessionHandle>>>,
    next_id: Arc<AtomicU64>,
    host_info: HostInfo,
    pid: u32,
    server_start_wall_ms: i64,
    server_start_mono: Instant,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { return; }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let hello_info = HelloInfo {
                            package_name: host_info.package_name.clone(),
                            process_name: host_info.process_name.clone(),
                            pid,
                            server_start_wall_ms,
                            server_start_mono_ns: server_start_mono.elapsed().as_nanos() as i64,
                            mode: host_info.mode,
                            capabilities: host_info.capabilities.clone(),
                            app_icon: host_info.app_icon.clone(),
                        };
                        Session::spawn(
                            stream,
                            id,
                            config.clone(),
                            registry.clone(),
                            hello_info,
                            sessions.clone(),
                            shutdown_rx.clone(),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error, continuing");
                    }
                }
            }
        }
    }
}

fn now_wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Binds a Unix domain socket named after `name`. On Linux, uses the
/// abstract-namespace form (no filesystem entry, cleaned up automatically
/// when the last reference closes); elsewhere falls back to a path under
/// the platform temp directory.
fn bind_listener(name: &str) -> std::io::Result<UnixListener> {
    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        return UnixListener::from_std(std_listener);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let path = std::env::temp_dir().join(name);
        let _ = std::fs::remove_file(&path);
        UnixListener::bind(path)
    }
}
