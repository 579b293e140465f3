//! Broadcast fan-out to the event loops of all live connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tagwire_core::What;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::tag::{Tag, TagValue, must_expand_tags};

/// Who a broadcast is for.
#[derive(Debug, Clone)]
pub enum Dest {
    /// Nobody.
    None,
    /// Every connection, for connection-wide kinds.
    All,
    /// The connection with this key.
    Connection(u64),
    /// Passed through to every connection as a raw HTML id target.
    Html(String),
    /// Elements carrying any of these tags.
    Tags(Vec<Tag>),
}

/// A broadcast message.
#[derive(Debug, Clone)]
pub struct Message {
    pub dest: Dest,
    pub what: What,
    pub data: String,
}

impl Message {
    pub fn new(dest: Dest, what: What, data: impl Into<String>) -> Self {
        Self {
            dest,
            what,
            data: data.into(),
        }
    }

    /// A message for the elements tagged with `tags`. Expansion errors are
    /// logged and yield a message for nobody.
    pub fn to_tags(tags: &TagValue, what: What, data: impl Into<String>) -> Self {
        let tags = must_expand_tags(None, tags);
        let dest = if tags.is_empty() {
            Dest::None
        } else {
            Dest::Tags(tags)
        };
        Self::new(dest, what, data)
    }
}

struct Subscriber {
    conn: Arc<Connection>,
    tx: mpsc::Sender<Message>,
}

/// Broadcast hub.
///
/// Delivery is non-blocking: a subscriber whose queue is full is dropped
/// rather than stalling everyone else. Its connection sees the closed queue
/// and shuts down.
///
/// Dirty tags are not broadcasts: they reach every keyed connection, including
/// ones still waiting for their WebSocket.
pub struct Hub {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    known: Mutex<HashMap<u64, Weak<Connection>>>,
    shutdown: CancellationToken,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled when the hub closes. Connection tokens are children of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_done(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the hub. Every connection is cancelled and further broadcasts
    /// are dropped.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.subscribers.lock().clear();
        self.known.lock().clear();
    }

    /// Start delivering dirty tags to the connection keyed `key`.
    pub(crate) fn track(&self, key: u64, conn: Weak<Connection>) {
        if key != 0 && !self.is_done() {
            self.known.lock().insert(key, conn);
        }
    }

    pub(crate) fn forget(&self, key: u64) {
        self.known.lock().remove(&key);
    }

    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.known.lock().len()
    }

    /// Subscribe a keyed connection. Returns `None` once the hub is closed.
    pub fn subscribe(&self, conn: &Arc<Connection>, capacity: usize) -> Option<mpsc::Receiver<Message>> {
        if self.is_done() {
            return None;
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let key = conn.key();
        self.track(key, Arc::downgrade(conn));
        self.subscribers.lock().insert(
            key,
            Subscriber {
                conn: conn.clone(),
                tx,
            },
        );
        crate::metrics::record_subscriber_count(self.subscriber_count());
        Some(rx)
    }

    pub fn unsubscribe(&self, key: u64) {
        if self.subscribers.lock().remove(&key).is_some() {
            crate::metrics::record_subscriber_count(self.subscriber_count());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `msg` to every subscriber that wants it.
    pub fn broadcast(&self, msg: Message) {
        if self.is_done() {
            debug!(what = %msg.what, "hub closed, dropping broadcast");
            return;
        }
        crate::metrics::record_broadcast(msg.what.as_str());
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|key, sub| {
            if !sub.conn.wants(&msg) {
                return true;
            }
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        conn = %tagwire_core::keys::key_string(*key),
                        what = %msg.what,
                        "broadcast queue full, dropping subscriber"
                    );
                    crate::metrics::record_error("broadcast_overflow");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Mark `tags` dirty on every keyed connection, pending or served.
    pub fn dirty(&self, tags: &TagValue) {
        self.dirty_tags(&must_expand_tags(None, tags));
    }

    pub fn dirty_tags(&self, tags: &[Tag]) {
        if tags.is_empty() {
            return;
        }
        let conns: Vec<Arc<Connection>> = self
            .known
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for conn in conns {
            conn.mark_dirty(tags);
        }
    }

    /// Broadcast to the elements carrying `tags`.
    pub fn send_to_tags(&self, tags: &TagValue, what: What, data: impl Into<String>) {
        self.broadcast(Message::to_tags(tags, what, data));
    }

    /// Replace the inner HTML of tagged elements.
    pub fn set_inner(&self, tags: &TagValue, html: impl Into<String>) {
        self.send_to_tags(tags, What::Inner, html);
    }

    pub fn set_attr(&self, tags: &TagValue, attr: &str, value: &str) {
        self.send_to_tags(tags, What::SetAttr, format!("{attr}\n{value}"));
    }

    pub fn remove_attr(&self, tags: &TagValue, attr: &str) {
        self.send_to_tags(tags, What::RemoveAttr, attr);
    }

    pub fn set_class(&self, tags: &TagValue, class: &str) {
        self.send_to_tags(tags, What::SetClass, class);
    }

    pub fn remove_class(&self, tags: &TagValue, class: &str) {
        self.send_to_tags(tags, What::RemoveClass, class);
    }

    pub fn set_value(&self, tags: &TagValue, value: impl Into<String>) {
        self.send_to_tags(tags, What::Value, value);
    }

    /// Append a child node to tagged elements.
    pub fn append(&self, tags: &TagValue, html: impl Into<String>) {
        self.send_to_tags(tags, What::Append, html);
    }

    /// Replace tagged elements' DOM nodes.
    pub fn replace(&self, tags: &TagValue, html: impl Into<String>) {
        self.send_to_tags(tags, What::Replace, html);
    }

    /// Delete tagged elements in every connection and in the browser.
    pub fn delete(&self, tags: &TagValue) {
        self.send_to_tags(tags, What::Delete, "");
    }

    /// Run the update hooks of tagged elements right away.
    pub fn update(&self, tags: &TagValue) {
        self.send_to_tags(tags, What::Update, "");
    }

    /// Send to a raw HTML id on every page.
    pub fn send_to_html(&self, id: impl Into<String>, what: What, data: impl Into<String>) {
        self.broadcast(Message::new(Dest::Html(id.into()), what, data));
    }

    pub fn reload(&self) {
        self.broadcast(Message::new(Dest::All, What::Reload, ""));
    }

    pub fn redirect(&self, url: &str) {
        self.broadcast(Message::new(Dest::All, What::Redirect, url));
    }

    /// Alert every page. `level` is a Bootstrap alert level.
    pub fn alert(&self, level: &str, text: &str) {
        self.broadcast(Message::new(Dest::All, What::Alert, format!("{level}\n{text}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InitialRequest;
    use crate::element::{Element, Ui};

    struct Noop;

    impl Ui for Noop {
        fn update(&self, _elem: &Element) {}
    }

    fn keyed(hub: &Arc<Hub>, key: u64) -> Arc<Connection> {
        let conn = Connection::new(hub.clone());
        conn.reset(key, InitialRequest::default(), None);
        conn
    }

    #[test]
    fn test_broadcast_only_reaches_interested() {
        let hub = Arc::new(Hub::new());
        let a = keyed(&hub, 1);
        let b = keyed(&hub, 2);
        a.new_element(Arc::new(Noop)).tag(Tag::name("x")).unwrap();
        let mut rx_a = hub.subscribe(&a, 4).unwrap();
        let mut rx_b = hub.subscribe(&b, 4).unwrap();

        hub.set_inner(&Tag::name("x").into(), "hi");
        let got = rx_a.try_recv().unwrap();
        assert_eq!(got.what, What::Inner);
        assert_eq!(got.data, "hi");
        assert!(rx_b.try_recv().is_err());

        hub.reload();
        assert_eq!(rx_a.try_recv().unwrap().what, What::Reload);
        assert_eq!(rx_b.try_recv().unwrap().what, What::Reload);
    }

    #[test]
    fn test_slow_subscriber_is_dropped() {
        let hub = Arc::new(Hub::new());
        let slow = keyed(&hub, 1);
        let fast = keyed(&hub, 2);
        let mut slow_rx = hub.subscribe(&slow, 1).unwrap();
        let mut fast_rx = hub.subscribe(&fast, 8).unwrap();

        hub.alert("info", "one");
        hub.alert("info", "two");
        assert_eq!(hub.subscriber_count(), 1);

        // the slow one still gets what fit, then sees the queue closed
        assert!(slow_rx.try_recv().is_ok());
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_closed_hub_refuses_subscribers_and_cancels() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 1);
        hub.close();
        assert!(hub.is_done());
        assert!(conn.is_cancelled());
        assert!(hub.subscribe(&conn, 1).is_none());
    }

    #[test]
    fn test_dirty_marks_subscribers() {
        let hub = Arc::new(Hub::new());
        let conn = keyed(&hub, 1);
        let elem = conn.new_element(Arc::new(Noop));
        elem.tag(Tag::name("t")).unwrap();
        let _rx = hub.subscribe(&conn, 1).unwrap();
        hub.dirty(&Tag::name("t").into());
        let todo = conn.make_update_list();
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].jid(), elem.jid());
    }

    #[test]
    fn test_to_tags_with_bad_value_goes_nowhere() {
        let msg = Message::to_tags(&TagValue::Int(3), What::Inner, "");
        assert!(matches!(msg.dest, Dest::None));
    }

    #[test]
    fn test_send_to_html_reaches_every_page() {
        let hub = Arc::new(Hub::new());
        let a = keyed(&hub, 1);
        let b = keyed(&hub, 2);
        let mut rx_a = hub.subscribe(&a, 4).unwrap();
        let mut rx_b = hub.subscribe(&b, 4).unwrap();

        hub.send_to_html("banner", What::Inner, "<b>news</b>");
        for rx in [&mut rx_a, &mut rx_b] {
            let got = rx.try_recv().unwrap();
            assert!(matches!(&got.dest, Dest::Html(id) if id == "banner"));
            assert_eq!(got.data, "<b>news</b>");
        }
    }
}
