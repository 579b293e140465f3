//! Gateway shared state: pending connections, the reuse pool and sessions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tagwire_core::config::TagwireConfig;
use tagwire_core::keys::key_string;
use tracing::{debug, info, warn};

use crate::connection::{Connection, InitialRequest};
use crate::hub::Hub;
use crate::session::{Session, SessionManager};

/// Cleared connections kept around for reuse.
const POOL_LIMIT: usize = 64;

/// Shared gateway state accessible from all routes and connections.
pub struct GatewayState {
    pub config: Arc<TagwireConfig>,
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionManager>,
    /// Rendered pages waiting for their WebSocket, by key.
    pending: RwLock<HashMap<u64, Arc<Connection>>>,
    pool: Mutex<Vec<Arc<Connection>>>,
}

impl GatewayState {
    pub fn new(config: TagwireConfig) -> Self {
        let hub = Arc::new(Hub::new());
        let sessions = Arc::new(SessionManager::new(
            hub.clone(),
            config.cookie_name(),
            config.session_grace(),
        ));
        Self {
            config: Arc::new(config),
            hub,
            sessions,
            pending: RwLock::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Start a connection for a page being rendered.
    ///
    /// The connection gets a fresh random key and waits in the pending map
    /// until its WebSocket claims it or the request timeout passes.
    pub fn new_connection(&self, initial: InitialRequest, session: Option<Arc<Session>>) -> Arc<Connection> {
        let conn = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| Connection::new(self.hub.clone()));
        let remote_ip = initial.remote_ip;
        {
            let mut pending = self.pending.write();
            let key = loop {
                let key: u64 = rand::random();
                if key != 0 && !pending.contains_key(&key) {
                    break key;
                }
            };
            conn.reset(key, initial, session.clone());
            pending.insert(key, conn.clone());
        }
        if let Some(session) = &session {
            session.add_connection(&conn);
        }
        debug!(conn = %conn.key_string(), ip = ?remote_ip, "pending connection created");
        crate::metrics::record_pending_count(self.pending_count());
        conn
    }

    /// Claim the pending connection `key` for a request from `remote_ip`.
    ///
    /// Returns `None` for unknown keys or when the claim is refused; a
    /// refused claim leaves the connection pending.
    pub fn use_connection(&self, key: u64, remote_ip: Option<IpAddr>) -> Option<Arc<Connection>> {
        if key == 0 {
            return None;
        }
        let conn = {
            let mut pending = self.pending.write();
            let conn = pending.get(&key)?.clone();
            if let Err(err) = conn.claim(remote_ip) {
                warn!(conn = %key_string(key), error = %err, "claim refused");
                crate::metrics::record_error(err.kind());
                return None;
            }
            pending.remove(&key);
            conn
        };
        if let Some(session) = conn.session() {
            self.sessions.restore(&session);
        }
        crate::metrics::record_pending_count(self.pending_count());
        Some(conn)
    }

    pub fn get_pending(&self, key: u64) -> Option<Arc<Connection>> {
        self.pending.read().get(&key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Capacity of the broadcast, inbound, event and outbound queues for
    /// `conn`: the configured value, or room for a few messages per element.
    pub fn queue_capacity(&self, conn: &Connection) -> usize {
        self.config
            .queue_capacity()
            .unwrap_or_else(|| 4 + conn.element_count() * 4)
    }

    /// Clear `conn` and keep it for reuse if nobody else holds it.
    pub fn recycle(&self, conn: Arc<Connection>) {
        let key = conn.key();
        {
            let mut pending = self.pending.write();
            if pending.get(&key).is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                pending.remove(&key);
            }
        }
        conn.clear();
        if Arc::strong_count(&conn) == 1 {
            let mut pool = self.pool.lock();
            if pool.len() < POOL_LIMIT {
                pool.push(conn);
            }
        }
        crate::metrics::record_pending_count(self.pending_count());
    }

    /// Expire pending connections past the request timeout and forget dead
    /// sessions.
    pub fn maintenance(&self, now: Instant) {
        let timeout = self.config.request_timeout();
        let mut expired = Vec::new();
        self.pending.write().retain(|_, conn| {
            if conn.maintenance(now, timeout) {
                expired.push(conn.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired pending connections");
        }
        for conn in expired {
            self.recycle(conn);
        }
        let swept = self.sessions.sweep(now);
        if swept > 0 {
            debug!(count = swept, "swept dead sessions");
        }
    }

    /// Run maintenance until the hub closes.
    pub async fn serve(self: Arc<Self>) {
        let period = (self.config.request_timeout() / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let shutdown = self.hub.shutdown_token();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.maintenance(Instant::now()),
            }
        }
        debug!("maintenance loop stopped");
    }

    /// Close the hub and drop every pending connection.
    pub fn close(&self) {
        info!("closing gateway state");
        self.hub.close();
        let pending: Vec<_> = self.pending.write().drain().map(|(_, c)| c).collect();
        for conn in pending {
            conn.clear();
        }
        self.pool.lock().clear();
    }
}
