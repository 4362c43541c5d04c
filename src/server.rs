//! TCP accept loop and the cross-session registry that routes cancel
//! requests. The registry is the only state shared between sessions and
//! sits behind a single mutex.

use crate::auth::Credentials;
use crate::backend::Interrupt;
use crate::config::Config;
use crate::session::handle_connection;
use crate::translator::QueryTranslator;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Maps `(pid, secret)` to the interrupt handle of the session's backend.
/// Sessions register at startup and deregister on teardown; cancel-request
/// connections only ever read.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<(i32, i32), Arc<dyn Interrupt>>>,
    next_pid: AtomicI32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            next_pid: AtomicI32::new(1),
        }
    }

    pub fn register(&self, interrupt: Arc<dyn Interrupt>) -> (i32, i32) {
        let process_id = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let secret_key = rand::random::<i32>();
        self.sessions
            .lock()
            .insert((process_id, secret_key), interrupt);
        (process_id, secret_key)
    }

    pub fn deregister(&self, process_id: i32, secret_key: i32) {
        self.sessions.lock().remove(&(process_id, secret_key));
    }

    /// Interrupt the matching session's in-flight backend call. Both the
    /// pid and the secret must match.
    pub fn cancel(&self, process_id: i32, secret_key: i32) -> bool {
        let interrupt = self
            .sessions
            .lock()
            .get(&(process_id, secret_key))
            .cloned();
        match interrupt {
            Some(interrupt) => {
                interrupt.interrupt();
                true
            }
            None => false,
        }
    }

    pub fn interrupt_all(&self) {
        for interrupt in self.sessions.lock().values() {
            interrupt.interrupt();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable server-wide state shared by every session.
pub struct ServerState {
    pub config: Arc<Config>,
    pub translator: Arc<QueryTranslator>,
    pub credentials: Option<Credentials>,
    pub registry: SessionRegistry,
    pub shutdown: CancellationToken,
}

pub struct ProxyServer {
    state: Arc<ServerState>,
}

impl ProxyServer {
    pub fn new(config: Config) -> anyhow::Result<ProxyServer> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        let translator = QueryTranslator::from_config(&config)
            .map_err(|e| anyhow::anyhow!("cannot load translation rules: {e}"))?;
        let credentials = if config.authenticate {
            let credentials = Credentials::resolve(config.credentials_file.as_deref())
                .map_err(|e| anyhow::anyhow!("cannot resolve credentials: {e}"))?;
            Some(credentials)
        } else {
            None
        };
        Ok(ProxyServer {
            state: Arc::new(ServerState {
                config: Arc::new(config),
                translator: Arc::new(translator),
                credentials,
                registry: SessionRegistry::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let port = self.state.config.server_port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("cannot bind port {port}"))?;
        info!("listening on port {port}");
        self.serve(listener).await
    }

    /// Accept loop on an already-bound listener; also the test entry point.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.context("accept failed")?;
                    stream.set_nodelay(true).ok();
                    let state = self.state.clone();
                    sessions.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr.to_string(), state).await {
                            error!("connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        info!("shutting down, {} live sessions", self.state.registry.len());
        // Wake sessions stuck inside a backend call so they observe the
        // shutdown token and send the admin-shutdown error.
        self.state.registry.interrupt_all();
        sessions.close();
        sessions.wait().await;
        Ok(())
    }
}
