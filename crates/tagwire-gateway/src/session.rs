//! Cookie-identified sessions spanning a visitor's connections.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tagwire_core::What;
use tagwire_core::keys::{key_string, key_value};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::hub::{Dest, Hub, Message};

/// A `Set-Cookie` value for the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub secure: bool,
    /// Seconds until expiry; negative asks the browser to delete it.
    pub max_age: Option<i64>,
}

impl SessionCookie {
    pub fn is_deletion(&self) -> bool {
        self.max_age.is_some_and(|age| age < 0)
    }
}

impl fmt::Display for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}; Path=/; HttpOnly; SameSite=Lax", self.name, self.value)?;
        if self.secure {
            f.write_str("; Secure")?;
        }
        match self.max_age {
            Some(age) if age < 0 => f.write_str("; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT"),
            Some(age) => write!(f, "; Max-Age={age}"),
            None => Ok(()),
        }
    }
}

struct SessionState {
    connections: Vec<Weak<Connection>>,
    deadline: Instant,
    closed: bool,
}

impl SessionState {
    fn live(&mut self) -> Vec<Arc<Connection>> {
        let live: Vec<_> = self.connections.iter().filter_map(Weak::upgrade).collect();
        self.connections.retain(|w| w.strong_count() > 0);
        live
    }
}

pub struct Session {
    id: u64,
    remote_ip: Option<IpAddr>,
    cookie_name: String,
    secure: bool,
    grace: Duration,
    hub: Arc<Hub>,
    state: Mutex<SessionState>,
    data: RwLock<HashMap<String, Value>>,
}

impl Session {
    fn new(
        id: u64,
        remote_ip: Option<IpAddr>,
        cookie_name: String,
        secure: bool,
        grace: Duration,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            id,
            remote_ip,
            cookie_name,
            secure,
            grace,
            hub,
            state: Mutex::new(SessionState {
                connections: Vec::new(),
                deadline: Instant::now() + grace,
                closed: false,
            }),
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cookie_value(&self) -> String {
        key_string(self.id)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Store a value. `Value::Null` removes the key.
    pub fn set(&self, key: &str, value: Value) {
        let mut data = self.data.write();
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.to_string(), value);
        }
    }

    /// Remove all stored values.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    pub(crate) fn add_connection(&self, conn: &Arc<Connection>) {
        let mut state = self.state.lock();
        state.connections.push(Arc::downgrade(conn));
    }

    /// Detach `conn`. When the last connection goes, the grace period starts.
    pub(crate) fn remove_connection(&self, conn: &Connection) {
        let mut state = self.state.lock();
        state
            .connections
            .retain(|w| w.upgrade().is_some_and(|c| !std::ptr::eq(c.as_ref(), conn)));
        if state.connections.is_empty() {
            state.deadline = Instant::now() + self.grace;
        }
    }

    /// The session's live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().live()
    }

    /// Closed, or without connections past the grace deadline.
    pub fn is_dead(&self) -> bool {
        self.is_dead_at(Instant::now())
    }

    pub(crate) fn is_dead_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.closed || (state.live().is_empty() && now > state.deadline)
    }

    /// Push the deadline out to a full grace period from now.
    pub fn refresh(&self) {
        self.state.lock().deadline = Instant::now() + self.grace;
    }

    /// The cookie identifying this session. Dead sessions yield a deletion
    /// cookie.
    pub fn cookie(&self) -> SessionCookie {
        let max_age = if self.is_dead() {
            -1
        } else {
            self.grace.as_secs() as i64
        };
        SessionCookie {
            name: self.cookie_name.clone(),
            value: self.cookie_value(),
            secure: self.secure,
            max_age: Some(max_age),
        }
    }

    /// Close the session: detach and reload every connection, and return a
    /// deletion cookie.
    pub fn close(&self) -> SessionCookie {
        let conns = {
            let mut state = self.state.lock();
            state.closed = true;
            let conns = state.live();
            state.connections.clear();
            conns
        };
        for conn in &conns {
            conn.detach_session(self);
            self.hub
                .broadcast(Message::new(Dest::Connection(conn.key()), What::Reload, ""));
        }
        info!(session = %self.cookie_value(), connections = conns.len(), "session closed");
        self.cookie()
    }

    /// Reload every page of this session.
    pub fn reload(&self) {
        self.broadcast(What::Reload, "");
    }

    /// Send a connection-wide message to every page of this session.
    pub fn broadcast(&self, what: What, data: &str) {
        for conn in self.connections() {
            self.hub
                .broadcast(Message::new(Dest::Connection(conn.key()), what, data));
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session<{}>", self.cookie_value())
    }
}

/// Values of cookie `name` in a `Cookie` header.
fn cookie_values<'a>(header: &'a str, name: &str) -> Vec<&'a str> {
    header
        .split(';')
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then_some(v.trim_matches('"'))
        })
        .collect()
}

/// All sessions of the gateway, keyed by id.
pub struct SessionManager {
    hub: Arc<Hub>,
    cookie_name: String,
    grace: Duration,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(hub: Arc<Hub>, cookie_name: String, grace: Duration) -> Self {
        Self {
            hub,
            cookie_name,
            grace,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// The live session named by the `Cookie` header and bound to `remote_ip`.
    pub fn get_session(&self, cookie_header: Option<&str>, remote_ip: Option<IpAddr>) -> Option<Arc<Session>> {
        let header = cookie_header?;
        let sessions = self.sessions.read();
        cookie_values(header, &self.cookie_name)
            .into_iter()
            .map(key_value)
            .filter(|id| *id != 0)
            .filter_map(|id| sessions.get(&id))
            .find(|s| s.ip() == remote_ip && !s.is_dead())
            .cloned()
    }

    /// Find or create the visitor's session. The cookie is returned when it
    /// must be set on the response: for a new session, or to refresh the
    /// expiry of an existing one.
    pub fn ensure_session(
        &self,
        cookie_header: Option<&str>,
        remote_ip: Option<IpAddr>,
        secure: bool,
    ) -> (Arc<Session>, SessionCookie) {
        if let Some(session) = self.get_session(cookie_header, remote_ip) {
            session.refresh();
            let cookie = session.cookie();
            return (session, cookie);
        }
        let session = {
            let mut sessions = self.sessions.write();
            let id = loop {
                let id: u64 = rand::random();
                if id != 0 && !sessions.contains_key(&id) {
                    break id;
                }
            };
            let session = Arc::new(Session::new(
                id,
                remote_ip,
                self.cookie_name.clone(),
                secure,
                self.grace,
                self.hub.clone(),
            ));
            sessions.insert(id, session.clone());
            session
        };
        debug!(session = %session.cookie_value(), "session created");
        crate::metrics::record_session_count(self.session_count());
        let cookie = session.cookie();
        (session, cookie)
    }

    /// Close and forget the visitor's session. Returns the deletion cookie,
    /// or `None` if there was no session.
    pub fn delete_session(&self, cookie_header: Option<&str>, remote_ip: Option<IpAddr>) -> Option<SessionCookie> {
        let session = self.get_session(cookie_header, remote_ip)?;
        self.sessions.write().remove(&session.id());
        crate::metrics::record_session_count(self.session_count());
        Some(session.close())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Forget dead sessions. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let dead: Vec<u64> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.is_dead_at(now))
            .map(|(id, _)| *id)
            .collect();
        if dead.is_empty() {
            return 0;
        }
        let mut sessions = self.sessions.write();
        for id in &dead {
            sessions.remove(id);
        }
        drop(sessions);
        crate::metrics::record_session_count(self.session_count());
        dead.len()
    }

    /// Put a session back after it was swept while connections still held it.
    pub(crate) fn restore(&self, session: &Arc<Session>) {
        self.sessions
            .write()
            .entry(session.id())
            .or_insert_with(|| session.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InitialRequest;
    use std::net::Ipv4Addr;

    const IP: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    fn manager(grace: Duration) -> SessionManager {
        SessionManager::new(Arc::new(Hub::new()), "tw".into(), grace)
    }

    #[test]
    fn test_ensure_creates_then_finds() {
        let mgr = manager(Duration::from_secs(60));
        let (s1, cookie) = mgr.ensure_session(None, IP, false);
        assert_eq!(cookie.name, "tw");
        assert_eq!(cookie.value, s1.cookie_value());
        assert_eq!(cookie.max_age, Some(60));

        let header = format!("other=1; tw={}", cookie.value);
        let (s2, _) = mgr.ensure_session(Some(&header), IP, false);
        assert_eq!(s1.id(), s2.id());
        assert_eq!(mgr.session_count(), 1);
    }

    #[test]
    fn test_session_bound_to_ip() {
        let mgr = manager(Duration::from_secs(60));
        let (s, _) = mgr.ensure_session(None, IP, false);
        let header = format!("tw={}", s.cookie_value());
        assert!(mgr.get_session(Some(&header), IP).is_some());
        let other = Some(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        assert!(mgr.get_session(Some(&header), other).is_none());
        assert!(mgr.get_session(Some("tw=zzz"), IP).is_none());
    }

    #[test]
    fn test_set_get_clear() {
        let mgr = manager(Duration::from_secs(60));
        let (s, _) = mgr.ensure_session(None, IP, false);
        s.set("user", serde_json::json!("ann"));
        assert_eq!(s.get("user"), Some(serde_json::json!("ann")));
        s.set("user", Value::Null);
        assert_eq!(s.get("user"), None);
        s.set("a", serde_json::json!(1));
        s.clear();
        assert_eq!(s.get("a"), None);
    }

    #[test]
    fn test_grace_period_and_sweep() {
        let mgr = manager(Duration::from_secs(5));
        let (s, _) = mgr.ensure_session(None, IP, false);
        let now = Instant::now();
        assert!(!s.is_dead_at(now));
        assert_eq!(mgr.sweep(now), 0);
        assert_eq!(mgr.sweep(now + Duration::from_secs(6)), 1);
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_live_connection_keeps_session_alive() {
        let mgr = manager(Duration::from_secs(5));
        let (s, _) = mgr.ensure_session(None, IP, false);
        let conn = Connection::new(mgr.hub.clone());
        conn.reset(42, InitialRequest::default(), Some(s.clone()));
        s.add_connection(&conn);
        assert!(!s.is_dead_at(Instant::now() + Duration::from_secs(60)));
        assert_eq!(s.connections().len(), 1);

        s.remove_connection(&conn);
        assert!(s.connections().is_empty());
        assert!(s.is_dead_at(Instant::now() + Duration::from_secs(6)));
    }

    #[test]
    fn test_close_detaches_and_deletes_cookie() {
        let mgr = manager(Duration::from_secs(60));
        let (s, _) = mgr.ensure_session(None, IP, true);
        let conn = Connection::new(mgr.hub.clone());
        conn.reset(7, InitialRequest::default(), Some(s.clone()));
        s.add_connection(&conn);

        let header = format!("tw={}", s.cookie_value());
        let cookie = mgr.delete_session(Some(&header), IP).unwrap();
        assert!(cookie.is_deletion());
        assert!(cookie.to_string().contains("Max-Age=0"));
        assert!(cookie.to_string().contains("; Secure"));
        assert!(conn.session().is_none());
        assert!(s.is_dead());
        assert_eq!(mgr.session_count(), 0);
        assert!(mgr.delete_session(Some(&header), IP).is_none());
    }

    #[test]
    fn test_cookie_display() {
        let cookie = SessionCookie {
            name: "tw".into(),
            value: "abc".into(),
            secure: false,
            max_age: Some(60),
        };
        assert_eq!(cookie.to_string(), "tw=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=60");
    }

    #[test]
    fn test_cookie_turns_into_deletion_after_grace() {
        let mgr = manager(Duration::from_millis(20));
        let (s, cookie) = mgr.ensure_session(None, IP, false);
        assert!(!cookie.is_deletion());
        assert!(!s.cookie().is_deletion());

        std::thread::sleep(Duration::from_millis(50));
        let cookie = s.cookie();
        assert!(cookie.is_deletion());
        assert!(cookie.to_string().contains("Max-Age=0"));
        assert_eq!(cookie.value, s.cookie_value());
    }
}
