//! One browser page view: element registry, outbound queue and event loop.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tagwire_core::keys::key_string;
use tagwire_core::{Jid, Result, Target, TagwireError, What, WireMessage};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::element::{Element, Ui};
use crate::event::{EventCall, call_event_handlers, spawn_event_worker};
use crate::hub::{Dest, Hub, Message};
use crate::registry::Registry;
use crate::session::Session;
use crate::tag::{Tag, TagValue, expand_tags, must_expand_tags};

/// Called once the WebSocket is up, before messages are processed. An error
/// is shown to the user and ends the connection.
pub type ConnectFn = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// What is known about the HTTP request that rendered the page.
#[derive(Debug, Clone, Default)]
pub struct InitialRequest {
    pub remote_ip: Option<IpAddr>,
    /// `Host` header value, possibly with a port.
    pub host: String,
    /// Whether the page was served over HTTPS.
    pub secure: bool,
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Not processing; pending or pooled.
    Idle,
    Running,
    /// Loop exited; waiting for the event worker and inbound queue.
    Draining,
    Terminated,
}

impl LoopState {
    fn from_u8(v: u8) -> LoopState {
        match v {
            1 => LoopState::Running,
            2 => LoopState::Draining,
            3 => LoopState::Terminated,
            _ => LoopState::Idle,
        }
    }
}

struct Meta {
    remote_ip: Option<IpAddr>,
    initial: Option<InitialRequest>,
    session: Option<Arc<Session>>,
    cancel: CancellationToken,
    cause: Option<Arc<TagwireError>>,
    last_write: Instant,
    connect_fn: Option<ConnectFn>,
}

pub struct Connection {
    this: Weak<Connection>,
    hub: Arc<Hub>,
    key: AtomicU64,
    claimed: AtomicBool,
    running: AtomicBool,
    rendering: AtomicBool,
    loop_state: AtomicU8,
    next_jid: AtomicU64,
    meta: Mutex<Meta>,
    /// Elements, tags and dirty tags. Never taken while `queue` is held.
    registry: RwLock<Registry>,
    queue: Mutex<Vec<WireMessage>>,
    dirty_wake: Notify,
}

impl Connection {
    /// A connection with no key. It accepts elements but is never served;
    /// the gateway hands out keyed ones through `GatewayState::new_connection`.
    pub fn new(hub: Arc<Hub>) -> Arc<Connection> {
        let cancel = hub.shutdown_token().child_token();
        Arc::new_cyclic(|this| Connection {
            this: this.clone(),
            hub,
            key: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            rendering: AtomicBool::new(false),
            loop_state: AtomicU8::new(LoopState::Idle as u8),
            next_jid: AtomicU64::new(0),
            meta: Mutex::new(Meta {
                remote_ip: None,
                initial: None,
                session: None,
                cancel,
                cause: None,
                last_write: Instant::now(),
                connect_fn: None,
            }),
            registry: RwLock::new(Registry::default()),
            queue: Mutex::new(Vec::new()),
            dirty_wake: Notify::new(),
        })
    }

    /// Prepare a fresh or pooled connection for a new page.
    pub(crate) fn reset(&self, key: u64, initial: InitialRequest, session: Option<Arc<Session>>) {
        let mut meta = self.meta.lock();
        meta.remote_ip = initial.remote_ip;
        meta.initial = Some(initial);
        meta.session = session;
        meta.cancel = self.hub.shutdown_token().child_token();
        meta.cause = None;
        meta.last_write = Instant::now();
        meta.connect_fn = None;
        self.claimed.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.rendering.store(false, Ordering::Release);
        self.set_loop_state(LoopState::Idle);
        self.key.store(key, Ordering::Release);
        drop(meta);
        self.hub.track(key, self.this.clone());
    }

    /// Drop all page state so the connection can be pooled. Existing
    /// elements are marked deleted and stop producing output.
    pub(crate) fn clear(&self) {
        let (key, session) = {
            let mut meta = self.meta.lock();
            let key = self.key.swap(0, Ordering::AcqRel);
            meta.cancel.cancel();
            meta.initial = None;
            meta.remote_ip = None;
            meta.connect_fn = None;
            (key, meta.session.take())
        };
        self.hub.forget(key);
        if let Some(session) = session {
            session.remove_connection(self);
        }
        self.registry.write().clear();
        self.queue.lock().clear();
        self.claimed.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.rendering.store(false, Ordering::Release);
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn key(&self) -> u64 {
        self.key.load(Ordering::Acquire)
    }

    pub fn key_string(&self) -> String {
        key_string(self.key())
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.meta.lock().remote_ip
    }

    pub fn initial(&self) -> Option<InitialRequest> {
        self.meta.lock().initial.clone()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.meta.lock().session.clone()
    }

    pub(crate) fn detach_session(&self, session: &Session) {
        let mut meta = self.meta.lock();
        if meta.session.as_ref().is_some_and(|s| s.id() == session.id()) {
            meta.session = None;
        }
    }

    /// Session value for `key`, if there is a session and the key is set.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.session().and_then(|s| s.get(key))
    }

    /// Set a session value. `Value::Null` removes it. No-op without a session.
    pub fn set(&self, key: &str, value: serde_json::Value) {
        if let Some(session) = self.session() {
            session.set(key, value);
        }
    }

    pub fn set_connect_fn(&self, f: Option<ConnectFn>) {
        self.meta.lock().connect_fn = f;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.meta.lock().cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.meta.lock().cancel.is_cancelled()
    }

    /// Why the connection was cancelled, if it was and a reason was given.
    pub fn cancel_cause(&self) -> Option<Arc<TagwireError>> {
        self.meta.lock().cause.clone()
    }

    pub fn loop_state(&self) -> LoopState {
        LoopState::from_u8(self.loop_state.load(Ordering::Acquire))
    }

    fn set_loop_state(&self, state: LoopState) {
        self.loop_state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Note that the page is still being written, which postpones the
    /// pending timeout.
    pub fn set_rendering(&self) {
        self.rendering.store(true, Ordering::Release);
    }

    /// Cancel the connection. Only the first cancellation counts, and an
    /// unkeyed connection cannot be cancelled. Errors on a connection that
    /// never started serving are wrapped in [`TagwireError::PendingCancelled`].
    pub fn cancel(&self, err: Option<TagwireError>) {
        let mut meta = self.meta.lock();
        let key = self.key();
        if key == 0 || meta.cancel.is_cancelled() {
            return;
        }
        let cause = match err {
            Some(err) if !self.is_running() => Some(TagwireError::PendingCancelled {
                key: key_string(key),
                cause: Box::new(err),
            }),
            other => other,
        };
        if let Some(err) = &cause {
            warn!(conn = %key_string(key), error = %err, "connection cancelled");
            crate::metrics::record_error(err.kind());
        }
        meta.cause = cause.map(Arc::new);
        meta.cancel.cancel();
    }

    /// Claim the pending connection for the WebSocket request coming from
    /// `remote_ip`. Succeeds once.
    pub(crate) fn claim(&self, remote_ip: Option<IpAddr>) -> Result<()> {
        if self.claimed.load(Ordering::Acquire) {
            return Err(TagwireError::RequestAlreadyClaimed);
        }
        let meta = self.meta.lock();
        let expected = meta.remote_ip;
        if !same_ip(expected, remote_ip) {
            return Err(TagwireError::RemoteIpMismatch {
                key: self.key_string(),
                expected,
                actual: remote_ip,
            });
        }
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TagwireError::RequestAlreadyClaimed)
    }

    /// Mark the connection as serving. Returns false if it already is.
    pub(crate) fn start_serve(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check the WebSocket `Origin` against the page's scheme and host.
    pub fn validate_origin(&self, origin: Option<&str>) -> Result<()> {
        let origin = origin
            .filter(|o| !o.is_empty())
            .ok_or(TagwireError::OriginMissing)?;
        let Some(initial) = self.initial() else {
            return Err(TagwireError::OriginMissing);
        };
        let (scheme, rest) = origin
            .split_once("://")
            .ok_or(TagwireError::OriginWrongScheme)?;
        let default_port = match scheme {
            "http" if !initial.secure => ":80",
            "https" if initial.secure => ":443",
            _ => return Err(TagwireError::OriginWrongScheme),
        };
        let host = rest.split('/').next().unwrap_or_default();
        let host = host.strip_suffix(default_port).unwrap_or(host);
        let page_host = initial.host.strip_suffix(default_port).unwrap_or(&initial.host);
        if host.is_empty() || !host.eq_ignore_ascii_case(page_host) {
            return Err(TagwireError::OriginWrongHost);
        }
        Ok(())
    }

    /// Pending-timeout check. Returns true once the connection should be
    /// dropped from the pending map.
    pub(crate) fn maintenance(&self, now: Instant, timeout: Duration) -> bool {
        if self.is_running() {
            return false;
        }
        let since = {
            let mut meta = self.meta.lock();
            if self.rendering.swap(false, Ordering::AcqRel) {
                meta.last_write = now;
            }
            if meta.cancel.is_cancelled() {
                return true;
            }
            now.saturating_duration_since(meta.last_write)
        };
        if since > timeout {
            let remote_ip = self.remote_ip();
            self.cancel(Some(TagwireError::NoWebSocketRequest { remote_ip }));
            return true;
        }
        false
    }

    pub(crate) fn on_connect(&self) -> Result<()> {
        let connect_fn = self.meta.lock().connect_fn.clone();
        match connect_fn {
            Some(f) => f(self),
            None => Ok(()),
        }
    }

    // ---- element registry ----

    /// Register a new element for `ui`, with no tags.
    pub fn new_element(&self, ui: Arc<dyn Ui>) -> Arc<Element> {
        let n = self.next_jid.fetch_add(1, Ordering::Relaxed) + 1;
        let jid = Jid::new(n).unwrap_or_else(|| unreachable!("jid counter starts at one"));
        let elem = Arc::new(Element::new(jid, ui, self.this.clone()));
        self.registry.write().insert(elem.clone());
        elem
    }

    /// Register a new element for `ui` and tag it.
    ///
    /// The element gets the UI object's own tags (from its tag provider, or
    /// its identity) plus `tags`. On a tagging error the element is removed
    /// again.
    pub fn register(&self, ui: Arc<dyn Ui>, tags: impl Into<TagValue>) -> Result<Arc<Element>> {
        let own = match ui.as_tag_provider() {
            Some(provider) => expand_tags(Some(self), &provider.provide_tag(Some(self)))?,
            None => vec![Tag::of(&ui)],
        };
        let extra = expand_tags(Some(self), &tags.into())?;
        let elem = self.new_element(ui);
        self.tag_expanded(&elem, &own);
        self.tag_expanded(&elem, &extra);
        Ok(elem)
    }

    pub fn element_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn get_element_by_jid(&self, jid: Jid) -> Option<Arc<Element>> {
        self.registry.read().get(jid).cloned()
    }

    /// Elements carrying any of the given tags.
    pub fn get_elements(&self, tags: &TagValue) -> Vec<Arc<Element>> {
        let tags = must_expand_tags(Some(self), tags);
        self.registry.read().elements_for(&tags)
    }

    fn find_arc(&self, elem: &Element) -> Option<Arc<Element>> {
        let registry = self.registry.read();
        registry
            .get(elem.jid())
            .filter(|e| std::ptr::eq(e.as_ref(), elem))
            .cloned()
    }

    /// Add tags to an element of this connection.
    pub fn tag(&self, elem: &Element, tags: &TagValue) -> Result<()> {
        let tags = expand_tags(Some(self), tags)?;
        if let Some(elem) = self.find_arc(elem) {
            self.tag_expanded(&elem, &tags);
        }
        Ok(())
    }

    pub fn tag_expanded(&self, elem: &Arc<Element>, tags: &[Tag]) {
        if elem.is_deleted() || tags.is_empty() {
            return;
        }
        let mut registry = self.registry.write();
        if registry.contains(elem) {
            registry.add_tags(elem, tags);
        }
    }

    pub fn has_tag(&self, elem: &Element, tag: &Tag) -> bool {
        self.registry.read().has_tag(elem, tag)
    }

    pub fn tags_of(&self, elem: &Element) -> Vec<Tag> {
        self.registry.read().tags_of(elem)
    }

    /// Remove an element and all its tag mappings.
    pub fn delete_element(&self, elem: &Element) {
        self.registry.write().remove(elem);
    }

    /// Delete the elements whose Jids are listed, tab separated.
    fn handle_remove(&self, data: &str) {
        let mut registry = self.registry.write();
        for jid in data.split('\t').filter_map(Jid::parse) {
            if let Some(elem) = registry.get(jid).cloned() {
                registry.remove(&elem);
            }
        }
    }

    // ---- dirty tracking ----

    /// Mark tags dirty on this connection and every other one the hub knows,
    /// whether or not its WebSocket is up yet.
    pub fn dirty(&self, tags: &TagValue) {
        let tags = must_expand_tags(Some(self), tags);
        self.mark_dirty(&tags);
        self.hub.dirty_tags(&tags);
    }

    /// Record dirty tags for this connection and wake its event loop.
    pub fn mark_dirty(&self, tags: &[Tag]) {
        if tags.is_empty() {
            return;
        }
        {
            let mut registry = self.registry.write();
            if !registry.wants_any(tags) {
                return;
            }
            registry.push_dirt(tags);
        }
        self.dirty_wake.notify_one();
    }

    /// Consume the dirty tags, returning affected elements by ascending Jid.
    pub fn make_update_list(&self) -> Vec<Arc<Element>> {
        self.registry.write().take_update_list()
    }

    // ---- outbound queue ----

    /// Queue a message for the browser and wake the event loop to flush it.
    pub fn queue(&self, msg: WireMessage) {
        self.queue.lock().push(msg);
        self.dirty_wake.notify_one();
    }

    /// Take the queued messages that may still be sent, ordered for flushing.
    ///
    /// Messages for deleted elements are dropped, except `Delete` itself.
    /// The sort is stable, so order within one target is preserved.
    pub fn take_outbound(&self) -> Vec<WireMessage> {
        let live = self.registry.read().live_jids();
        let mut msgs = std::mem::take(&mut *self.queue.lock());
        msgs.retain(|m| match m.target {
            Target::Jid(jid) => m.what == What::Delete || live.contains(&jid),
            _ => true,
        });
        msgs.sort_by_key(|m| m.target.order_key());
        msgs
    }

    /// Inline script applying attribute and class changes queued during
    /// rendering. Those messages are removed from the queue.
    pub fn tail_actions(&self) -> String {
        let mut script = String::new();
        let mut queue = self.queue.lock();
        queue.retain(|msg| {
            let func = match msg.what {
                What::SetAttr => "setAttribute",
                What::RemoveAttr => "removeAttribute",
                What::SetClass => "classList?.add",
                What::RemoveClass => "classList?.remove",
                _ => return true,
            };
            if script.is_empty() {
                script.push_str("\n<script>");
            }
            script.push_str("\ndocument.getElementById(");
            script.push_str(&js_quote(&msg.target.to_string()));
            script.push_str(")?.");
            script.push_str(func);
            script.push('(');
            match msg.data.split_once('\n') {
                Some((attr, value)) => {
                    script.push_str(&js_quote(attr));
                    script.push(',');
                    script.push_str(&js_quote(value));
                }
                None => script.push_str(&js_quote(&msg.data)),
            }
            script.push_str(");");
            false
        });
        if !script.is_empty() {
            script.push_str("\n</script>");
        }
        script
    }

    /// HTML for the end of the page body: a noscript fallback and any tail
    /// actions.
    pub fn tail_html(&self) -> String {
        let mut html = format!(
            "\n<noscript><div class=\"tagwire-alert\">This site requires Javascript for full functionality.</div>\
             <img src=\"/tagwire/{}/noscript\" alt=\"noscript\"></noscript>",
            self.key_string()
        );
        html.push_str(&self.tail_actions());
        html
    }

    /// HTML for the page head carrying the connection key.
    pub fn head_html(&self) -> String {
        format!("<meta name=\"tagwire\" content=\"{}\">", self.key_string())
    }

    // ---- user feedback ----

    /// Show an alert on this page. `level` is a Bootstrap alert level.
    pub fn alert(&self, level: &str, text: &str) {
        self.hub.broadcast(Message::new(
            Dest::Connection(self.key()),
            What::Alert,
            format!("{level}\n{text}"),
        ));
    }

    /// Show a `danger` alert with the escaped error text.
    pub fn alert_error(&self, err: &TagwireError) {
        warn!(conn = %self.key_string(), error = %err, "alerting error");
        let msg = WireMessage::alert_error(err);
        self.hub
            .broadcast(Message::new(Dest::Connection(self.key()), msg.what, msg.data));
    }

    pub fn redirect(&self, url: &str) {
        self.hub
            .broadcast(Message::new(Dest::Connection(self.key()), What::Redirect, url));
    }

    pub fn reload(&self) {
        self.hub
            .broadcast(Message::new(Dest::Connection(self.key()), What::Reload, ""));
    }

    // ---- routing ----

    /// Whether a broadcast message is relevant to this connection.
    pub(crate) fn wants(&self, msg: &Message) -> bool {
        match &msg.dest {
            Dest::None => false,
            Dest::All | Dest::Html(_) => true,
            Dest::Connection(key) => *key != 0 && *key == self.key(),
            Dest::Tags(tags) => self.registry.read().wants_any(tags),
        }
    }

    /// Run the handlers of the targeted elements.
    ///
    /// A targetless click carries `name\tJid.a\tJid.b…`; the listed elements
    /// are tried in order with `name` as the value. An event nobody handles
    /// is not an error.
    pub fn call_all_event_handlers(&self, target: &Target, what: What, value: &str) -> Result<()> {
        let mut value = value;
        let elems: Vec<Arc<Element>> = {
            let registry = self.registry.read();
            match target {
                Target::None if what == What::Click => {
                    let mut parts = value.split('\t');
                    value = parts.next().unwrap_or_default();
                    parts
                        .filter_map(Jid::parse)
                        .filter_map(|jid| registry.get(jid).cloned())
                        .filter(|e| !e.is_deleted())
                        .collect()
                }
                Target::Jid(jid) => registry
                    .get(*jid)
                    .filter(|e| !e.is_deleted())
                    .cloned()
                    .into_iter()
                    .collect(),
                _ => Vec::new(),
            }
        };
        for elem in elems {
            match call_event_handlers(&elem, what, value) {
                Err(err) if err.is_event_unhandled() => continue,
                other => return other,
            }
        }
        Ok(())
    }

    fn queue_event(&self, events: &mpsc::Sender<EventCall>, call: EventCall) {
        match events.try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                let err = TagwireError::QueueOverflow {
                    key: self.key_string(),
                    queue: "event",
                    message: format!("{} {} {:?}", call.what, call.target, call.data),
                };
                error!(conn = %self.key_string(), error = %err, "event queue overflow");
                self.cancel(Some(err));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn = %self.key_string(), "event worker gone, dropping event");
            }
        }
    }

    fn handle_incoming(&self, msg: WireMessage, events: &mpsc::Sender<EventCall>) {
        if matches!(msg.target, Target::Html(_)) {
            debug!(conn = %self.key_string(), %msg, "ignoring message for HTML id");
            return;
        }
        match msg.what {
            What::Input | What::Click | What::Set => self.queue_event(
                events,
                EventCall {
                    target: msg.target,
                    what: msg.what,
                    data: msg.data,
                },
            ),
            What::Remove => self.handle_remove(&msg.data),
            _ => debug!(conn = %self.key_string(), %msg, "ignoring inbound message"),
        }
    }

    fn handle_broadcast(&self, msg: Message, events: &mpsc::Sender<EventCall>) {
        let elems = match &msg.dest {
            Dest::Tags(tags) => self.registry.read().elements_for(tags),
            Dest::Html(id) => {
                self.queue(WireMessage::new(msg.what, Target::Html(id.clone()), msg.data));
                return;
            }
            Dest::None | Dest::All | Dest::Connection(_) => Vec::new(),
        };

        if msg.what.is_connection_wide() {
            self.queue(WireMessage::broadcast(msg.what, msg.data));
            return;
        }

        for elem in elems {
            match msg.what {
                What::Delete => {
                    self.queue(WireMessage::new(What::Delete, elem.jid(), ""));
                    self.delete_element(&elem);
                }
                What::Input | What::Click => self.queue_event(
                    events,
                    EventCall {
                        target: Target::Jid(elem.jid()),
                        what: msg.what,
                        data: msg.data.clone(),
                    },
                ),
                What::Hook => {
                    if let Err(err) =
                        self.call_all_event_handlers(&Target::Jid(elem.jid()), msg.what, &msg.data)
                    {
                        warn!(conn = %self.key_string(), error = %err, "hook failed");
                        let mut alert = WireMessage::alert_error(&err);
                        alert.target = Target::Jid(elem.jid());
                        self.queue(alert);
                    }
                }
                What::Update => elem.update(),
                what => self.queue(WireMessage::new(what, elem.jid(), msg.data.clone())),
            }
        }
    }

    async fn send_queue(&self, outbound: &mpsc::Sender<WireMessage>, cancel: &CancellationToken) {
        for msg in self.take_outbound() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = outbound.send(msg) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// The connection's event loop.
    ///
    /// Each round flushes the outbound queue, runs update hooks for dirty
    /// elements, flushes again, then waits for cancellation, a dirty wake-up,
    /// a broadcast or an inbound message. On exit it unsubscribes, releases
    /// the session, drains the event worker and inbound queue, and closes
    /// `outbound`.
    pub async fn process(
        self: Arc<Self>,
        mut broadcasts: mpsc::Receiver<Message>,
        mut incoming: mpsc::Receiver<WireMessage>,
        outbound: mpsc::Sender<WireMessage>,
    ) {
        let cancel = self.cancel_token();
        let (event_tx, event_rx) = mpsc::channel(outbound.max_capacity().max(1));
        let mut worker = spawn_event_worker(self.clone(), event_rx, outbound.clone());
        self.set_loop_state(LoopState::Running);
        debug!(conn = %self.key_string(), "event loop started");

        loop {
            self.send_queue(&outbound, &cancel).await;
            for elem in self.make_update_list() {
                elem.update();
            }
            self.send_queue(&outbound, &cancel).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.dirty_wake.notified() => {}
                msg = broadcasts.recv() => match msg {
                    Some(msg) => self.handle_broadcast(msg, &event_tx),
                    None => break,
                },
                msg = incoming.recv() => match msg {
                    Some(msg) => self.handle_incoming(msg, &event_tx),
                    None => break,
                },
            }
        }

        self.set_loop_state(LoopState::Draining);
        self.hub.unsubscribe(self.key());
        let session = self.meta.lock().session.take();
        if let Some(session) = session {
            session.remove_connection(&self);
        }
        // unblocks the writer and any pending send
        self.cancel(None);
        self.meta.lock().cancel.cancel();
        drop(event_tx);

        let mut incoming_open = true;
        loop {
            tokio::select! {
                res = &mut worker => {
                    if let Err(err) = res {
                        error!(conn = %self.key_string(), error = %err, "event worker panicked");
                    }
                    break;
                }
                msg = incoming.recv(), if incoming_open => {
                    if msg.is_none() {
                        incoming_open = false;
                    }
                }
            }
        }
        drop(outbound);
        self.set_loop_state(LoopState::Terminated);
        debug!(conn = %self.key_string(), "event loop done");
    }

    /// Wake the event loop, e.g. after queueing output from outside it.
    pub fn wake(&self) {
        self.dirty_wake.notify_one();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection<{}>", self.key_string())
    }
}

fn same_ip(a: Option<IpAddr>, b: Option<IpAddr>) -> bool {
    a.map(|ip| ip.to_canonical()) == b.map(|ip| ip.to_canonical())
}

/// Quote as a JS string literal safe inside a `<script>` block.
fn js_quote(s: &str) -> String {
    serde_json::Value::String(s.to_string())
        .to_string()
        .replace('<', "\\u003c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Counter {
        updates: Mutex<u32>,
    }

    impl Ui for Counter {
        fn update(&self, elem: &Element) {
            let mut n = self.updates.lock();
            *n += 1;
            elem.set_inner(n.to_string());
        }
    }

    fn keyed(hub: &Arc<Hub>, key: u64) -> Arc<Connection> {
        let conn = Connection::new(hub.clone());
        conn.reset(
            key,
            InitialRequest {
                remote_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                host: "example.com".into(),
                secure: false,
                uri: "/".into(),
            },
            None,
        );
        conn
    }

    fn jid(n: u64) -> Jid {
        Jid::new(n).unwrap()
    }

    #[test]
    fn test_jids_are_unique_and_ascending() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let a = conn.new_element(Arc::new(Counter::default()));
        let b = conn.new_element(Arc::new(Counter::default()));
        assert!(a.jid() < b.jid());
        assert_eq!(conn.get_element_by_jid(b.jid()).unwrap().jid(), b.jid());
    }

    #[test]
    fn test_register_tags_with_identity_and_extra() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let ui: Arc<dyn Ui> = Arc::new(Counter::default());
        let elem = conn.register(ui.clone(), Tag::name("A")).unwrap();
        assert!(elem.has_tag(&Tag::of(&ui)));
        assert!(elem.has_tag(&Tag::name("A")));
        assert_eq!(elem.tags().len(), 2);
    }

    #[test]
    fn test_register_rejects_illegal_tag() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let err = conn
            .register(Arc::new(Counter::default()), TagValue::Text("A".into()))
            .unwrap_err();
        assert!(matches!(err, TagwireError::IllegalTagType { .. }));
        assert_eq!(conn.element_count(), 0);
    }

    #[test]
    fn test_dirty_update_list_is_deduplicated_and_ordered() {
        let hub = Arc::new(Hub::new());
        let conn = Connection::new(hub);
        let e1 = conn.new_element(Arc::new(Counter::default()));
        let e2 = conn.new_element(Arc::new(Counter::default()));
        let e3 = conn.new_element(Arc::new(Counter::default()));
        conn.tag(&e3, &Tag::name("A").into()).unwrap();
        conn.tag(&e1, &Tag::name("A").into()).unwrap();
        conn.tag(&e1, &Tag::name("B").into()).unwrap();
        conn.tag(&e2, &Tag::name("C").into()).unwrap();

        conn.mark_dirty(&[Tag::name("B"), Tag::name("A"), Tag::name("A")]);
        let jids: Vec<_> = conn.make_update_list().iter().map(|e| e.jid()).collect();
        assert_eq!(jids, vec![e1.jid(), e3.jid()]);
        assert!(conn.make_update_list().is_empty());
    }

    #[test]
    fn test_delete_element_removes_tags_and_filters_queue() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let e1 = conn.new_element(Arc::new(Counter::default()));
        let e2 = conn.new_element(Arc::new(Counter::default()));
        e1.tag(Tag::name("A")).unwrap();
        e1.set_inner("one");
        e2.set_inner("two");
        conn.queue(WireMessage::new(What::Delete, e1.jid(), ""));
        conn.delete_element(&e1);

        assert!(e1.is_deleted());
        assert!(conn.get_elements(&Tag::name("A").into()).is_empty());
        assert!(conn.get_element_by_jid(e1.jid()).is_none());
        let out = conn.take_outbound();
        assert_eq!(
            out,
            vec![
                WireMessage::new(What::Delete, e1.jid(), ""),
                WireMessage::new(What::Inner, e2.jid(), "two"),
            ]
        );
        // deleted elements produce nothing further
        e1.set_inner("again");
        assert!(conn.take_outbound().is_empty());
    }

    #[test]
    fn test_outbound_order() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let e1 = conn.new_element(Arc::new(Counter::default()));
        let e2 = conn.new_element(Arc::new(Counter::default()));
        e2.set_inner("b1");
        e1.set_inner("a");
        conn.queue(WireMessage::broadcast(What::Reload, ""));
        e2.set_inner("b2");
        conn.queue(WireMessage::new(What::Inner, Target::Html("x".into()), "h"));
        let out: Vec<_> = conn.take_outbound().into_iter().map(|m| m.data).collect();
        assert_eq!(out, vec!["h", "", "a", "b1", "b2"]);
    }

    #[test]
    fn test_handle_remove_deletes_listed_jids() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let e1 = conn.new_element(Arc::new(Counter::default()));
        let e2 = conn.new_element(Arc::new(Counter::default()));
        let e3 = conn.new_element(Arc::new(Counter::default()));
        conn.handle_remove(&format!("{}\t{}\tJid.999\tgarbage", e1.jid(), e3.jid()));
        assert!(e1.is_deleted());
        assert!(!e2.is_deleted());
        assert!(e3.is_deleted());
    }

    #[test]
    fn test_tail_actions() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let elem = conn.new_element(Arc::new(Counter::default()));
        elem.set_attr("title", "</script>");
        elem.set_inner("keep");
        elem.set_class("active");
        let script = conn.tail_actions();
        let id = format!("\"{}\"", elem.jid());
        assert_eq!(
            script,
            format!(
                "\n<script>\ndocument.getElementById({id})?.setAttribute(\"title\",\"\\u003c/script>\");\
                 \ndocument.getElementById({id})?.classList?.add(\"active\");\n</script>"
            )
        );
        assert_eq!(conn.take_outbound(), vec![WireMessage::new(What::Inner, elem.jid(), "keep")]);
        assert!(conn.tail_actions().is_empty());
    }

    #[test]
    fn test_replace_requires_id() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let elem = conn.new_element(Arc::new(Counter::default()));
        let err = elem.replace("<div>no id</div>").unwrap_err();
        assert!(matches!(err, TagwireError::ReplaceMissingId { .. }));
        elem.replace(format!("<div {}>ok</div>", elem.jid().id_attr()))
            .unwrap();
        assert_eq!(conn.take_outbound().len(), 1);
    }

    #[test]
    fn test_element_helpers_wire_format() {
        let conn = Connection::new(Arc::new(Hub::new()));
        let elem = conn.new_element(Arc::new(Counter::default()));
        elem.set_attr("href", "/x");
        elem.remove_attr("disabled");
        elem.set_class("on");
        elem.remove_class("off");
        elem.set_value("42");
        elem.append("<li>x</li>");
        elem.order(&[jid(3), jid(1)]);
        elem.order(&[]);
        elem.remove("child");
        let got: Vec<_> = conn
            .take_outbound()
            .into_iter()
            .map(|m| format!("{} {}", m.what, m.data))
            .collect();
        assert_eq!(
            got,
            vec![
                "SAttr href\n/x",
                "RAttr disabled",
                "SClass on",
                "RClass off",
                "Value 42",
                "Append <li>x</li>",
                "Order Jid.3 Jid.1",
                "Remove child",
            ]
        );
    }

    #[test]
    fn test_cancel_pending_wraps_cause() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 77);
        conn.cancel(Some(TagwireError::JavascriptDisabled));
        assert!(conn.is_cancelled());
        let cause = conn.cancel_cause().unwrap();
        assert!(matches!(*cause, TagwireError::PendingCancelled { .. }));
        // second cancel is ignored
        conn.cancel(Some(TagwireError::OriginMissing));
        assert!(matches!(*conn.cancel_cause().unwrap(), TagwireError::PendingCancelled { .. }));
    }

    #[test]
    fn test_cancel_needs_key() {
        let conn = Connection::new(Arc::new(Hub::new()));
        conn.cancel(None);
        assert!(!conn.is_cancelled());
    }

    #[test]
    fn test_claim_checks_ip_and_succeeds_once() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 5);
        let err = conn.claim(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))).unwrap_err();
        assert!(matches!(err, TagwireError::RemoteIpMismatch { .. }));
        conn.claim(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
        let err = conn.claim(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap_err();
        assert!(matches!(err, TagwireError::RequestAlreadyClaimed));
    }

    #[test]
    fn test_validate_origin() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 9);
        conn.validate_origin(Some("http://example.com")).unwrap();
        conn.validate_origin(Some("http://EXAMPLE.com:80")).unwrap();
        assert!(matches!(conn.validate_origin(None), Err(TagwireError::OriginMissing)));
        assert!(matches!(
            conn.validate_origin(Some("https://example.com")),
            Err(TagwireError::OriginWrongScheme)
        ));
        assert!(matches!(
            conn.validate_origin(Some("ftp://example.com")),
            Err(TagwireError::OriginWrongScheme)
        ));
        assert!(matches!(
            conn.validate_origin(Some("http://evil.com")),
            Err(TagwireError::OriginWrongHost)
        ));
    }

    #[test]
    fn test_maintenance_times_out_pending() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 11);
        let now = Instant::now();
        assert!(!conn.maintenance(now, Duration::from_secs(10)));
        assert!(conn.maintenance(now + Duration::from_secs(11), Duration::from_secs(10)));
        match conn.cancel_cause().as_deref() {
            Some(TagwireError::PendingCancelled { cause, .. }) => {
                assert!(matches!(**cause, TagwireError::NoWebSocketRequest { .. }));
            }
            other => panic!("unexpected cause {other:?}"),
        }
    }

    #[test]
    fn test_rendering_postpones_timeout() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 12);
        let start = Instant::now();
        conn.set_rendering();
        assert!(!conn.maintenance(start + Duration::from_secs(8), Duration::from_secs(10)));
        assert!(!conn.maintenance(start + Duration::from_secs(15), Duration::from_secs(10)));
    }

    #[test]
    fn test_wants() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 3);
        let elem = conn.new_element(Arc::new(Counter::default()));
        elem.tag(Tag::name("A")).unwrap();
        let wants = |dest| conn.wants(&Message::new(dest, What::Inner, ""));
        assert!(wants(Dest::Tags(vec![Tag::name("Z"), Tag::name("A")])));
        assert!(!wants(Dest::Tags(vec![Tag::name("Z")])));
        assert!(wants(Dest::Connection(3)));
        assert!(!wants(Dest::Connection(4)));
        assert!(wants(Dest::Html("status".into())));
        assert!(wants(Dest::All));
        assert!(!wants(Dest::None));
    }

    #[test]
    fn test_clear_forgets_elements() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 8);
        let elem = conn.new_element(Arc::new(Counter::default()));
        elem.set_inner("x");
        conn.clear();
        assert_eq!(conn.key(), 0);
        assert!(elem.is_deleted());
        assert_eq!(conn.element_count(), 0);
        assert!(conn.take_outbound().is_empty());
        let next = conn.new_element(Arc::new(Counter::default()));
        assert!(next.jid() > elem.jid());
    }

    #[derive(Default)]
    struct Clicks {
        count: std::sync::atomic::AtomicUsize,
        delay: Duration,
    }

    impl Clicks {
        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Ui for Clicks {
        fn update(&self, _elem: &Element) {}

        fn as_click_handler(&self) -> Option<&dyn crate::element::ClickHandler> {
            Some(self)
        }
    }

    impl crate::element::ClickHandler for Clicks {
        fn on_click(&self, _elem: &Element, _name: &str) -> Result<()> {
            std::thread::sleep(self.delay);
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_has_tag_ignores_elements_of_other_connections() {
        let hub = Arc::new(Hub::new());
        let a = Connection::new(hub.clone());
        let b = Connection::new(hub);
        let ea = a.new_element(Arc::new(Counter::default()));
        let eb = b.new_element(Arc::new(Counter::default()));
        assert_eq!(ea.jid(), eb.jid());
        a.tag(&ea, &Tag::name("A").into()).unwrap();
        b.tag(&eb, &Tag::name("A").into()).unwrap();

        assert!(a.has_tag(&ea, &Tag::name("A")));
        assert!(!a.has_tag(&eb, &Tag::name("A")));
        assert!(a.tags_of(&eb).is_empty());

        a.tag_expanded(&eb, &[Tag::name("B")]);
        assert!(!a.has_tag(&ea, &Tag::name("B")));
        assert!(!b.has_tag(&eb, &Tag::name("B")));
    }

    #[tokio::test]
    async fn test_dirty_before_subscribe_reaches_first_loop_round() {
        use crate::state::GatewayState;
        use tagwire_core::config::TagwireConfig;

        let state = GatewayState::new(TagwireConfig::default());
        let a = state.new_connection(InitialRequest::default(), None);
        let b = state.new_connection(InitialRequest::default(), None);
        a.register(Arc::new(Counter::default()), Tag::name("A")).unwrap();
        b.register(Arc::new(Counter::default()), Tag::name("A")).unwrap();

        // neither page has its websocket yet
        a.dirty(&Tag::name("A").into());
        assert_eq!(b.make_update_list().len(), 1);

        let conn = state.use_connection(a.key(), None).unwrap();
        assert!(conn.start_serve());
        let broadcasts = state.hub.subscribe(&conn, 4).unwrap();
        let (_in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let task = tokio::spawn(conn.clone().process(broadcasts, in_rx, out_tx));

        let msg = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.what, What::Inner);
        assert_eq!(msg.data, "1");

        conn.cancel(None);
        task.await.unwrap();
    }

    #[test]
    fn test_recycled_connection_no_longer_gets_dirt() {
        use crate::state::GatewayState;
        use tagwire_core::config::TagwireConfig;

        let state = GatewayState::new(TagwireConfig::default());
        let conn = state.new_connection(InitialRequest::default(), None);
        let elem = conn.register(Arc::new(Counter::default()), Tag::name("A")).unwrap();
        assert_eq!(state.hub.tracked_count(), 1);
        state.recycle(conn.clone());
        assert!(elem.is_deleted());
        assert_eq!(state.hub.tracked_count(), 0);

        state.hub.dirty(&Tag::name("A").into());
        assert!(conn.make_update_list().is_empty());
    }

    #[tokio::test]
    async fn test_full_event_queue_fails_connection() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 1);
        let slow = Arc::new(Clicks {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let elem = conn.register(slow, Tag::name("s")).unwrap();
        assert!(conn.start_serve());
        let broadcasts = hub.subscribe(&conn, 8).unwrap();
        let (in_tx, in_rx) = mpsc::channel(8);
        // the event queue is sized like the outbound queue
        let (out_tx, _out_rx) = mpsc::channel(1);
        let task = tokio::spawn(conn.clone().process(broadcasts, in_rx, out_tx));

        for _ in 0..4 {
            let _ = in_tx.send(WireMessage::new(What::Click, elem.jid(), "x")).await;
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let cause = conn.cancel_cause().unwrap();
        assert!(matches!(
            cause.as_ref(),
            TagwireError::QueueOverflow { queue: "event", .. }
        ));
        assert_eq!(conn.loop_state(), LoopState::Terminated);
    }

    #[test]
    fn test_event_workers_share_a_small_blocking_pool() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let hub = Arc::new(Hub::new());
            let mut live = Vec::new();
            for key in 1..=8 {
                let conn = keyed(&hub, key);
                let clicks = Arc::new(Clicks::default());
                let elem = conn.register(clicks.clone(), Tag::name("c")).unwrap();
                assert!(conn.start_serve());
                let broadcasts = hub.subscribe(&conn, 4).unwrap();
                let (in_tx, in_rx) = mpsc::channel(4);
                let (out_tx, out_rx) = mpsc::channel(4);
                let task = tokio::spawn(conn.clone().process(broadcasts, in_rx, out_tx));
                in_tx
                    .send(WireMessage::new(What::Click, elem.jid(), "go"))
                    .await
                    .unwrap();
                live.push((conn, clicks, in_tx, out_rx, task));
            }

            let deadline = Instant::now() + Duration::from_secs(5);
            while live.iter().any(|(_, clicks, ..)| clicks.count() == 0) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let counts: Vec<usize> = live.iter().map(|(_, clicks, ..)| clicks.count()).collect();
            assert_eq!(counts, vec![1; 8]);

            for (conn, _, _, _, task) in live {
                conn.cancel(None);
                task.await.unwrap();
            }
        });
    }
}
