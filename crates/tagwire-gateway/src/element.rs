//! Elements: one UI object rendered once within one connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tagwire_core::{Jid, Result, TagwireError, What, WireMessage};

use crate::connection::Connection;
use crate::tag::{Tag, TagProvider, TagValue};

/// A server-side UI object.
///
/// The same object may be rendered many times, in many connections; each
/// rendering is an [`Element`]. Optional capabilities are exposed through the
/// `as_*` probes, which are consulted when the element is registered and when
/// events arrive.
pub trait Ui: Send + Sync + 'static {
    /// Called from the connection's event loop when one of the element's tags
    /// was marked dirty. Use the element's output helpers to queue changes.
    fn update(&self, elem: &Element);

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn as_click_handler(&self) -> Option<&dyn ClickHandler> {
        None
    }

    fn as_event_handler(&self) -> Option<&dyn EventHandler> {
        None
    }

    /// If present, the tags an element of this object is registered under.
    /// Otherwise the element is tagged with the object's identity.
    fn as_tag_provider(&self) -> Option<&dyn TagProvider> {
        None
    }
}

/// Receives every event routed to an element.
///
/// Return [`TagwireError::EventUnhandled`] to pass the event on to the next
/// handler in the element's chain.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, elem: &Element, what: What, value: &str) -> Result<()>;
}

/// Receives clicks. `name` is the clicked control's name; it may be empty.
pub trait ClickHandler: Send + Sync {
    fn on_click(&self, elem: &Element, name: &str) -> Result<()>;
}

/// Closure adapter for [`EventHandler`].
pub struct EventFn<F>(pub F);

impl<F> EventHandler for EventFn<F>
where
    F: Fn(&Element, What, &str) -> Result<()> + Send + Sync,
{
    fn on_event(&self, elem: &Element, what: What, value: &str) -> Result<()> {
        (self.0)(elem, what, value)
    }
}

/// Closure adapter for [`ClickHandler`].
pub struct ClickFn<F>(pub F);

impl<F> ClickHandler for ClickFn<F>
where
    F: Fn(&Element, &str) -> Result<()> + Send + Sync,
{
    fn on_click(&self, elem: &Element, name: &str) -> Result<()> {
        (self.0)(elem, name)
    }
}

/// An extra handler attached to an element after its UI object.
#[derive(Clone)]
pub enum Handler {
    Event(Arc<dyn EventHandler>),
    Click(Arc<dyn ClickHandler>),
}

impl Handler {
    pub fn event<F>(f: F) -> Handler
    where
        F: Fn(&Element, What, &str) -> Result<()> + Send + Sync + 'static,
    {
        Handler::Event(Arc::new(EventFn(f)))
    }

    pub fn click<F>(f: F) -> Handler
    where
        F: Fn(&Element, &str) -> Result<()> + Send + Sync + 'static,
    {
        Handler::Click(Arc::new(ClickFn(f)))
    }
}

pub struct Element {
    jid: Jid,
    ui: Arc<dyn Ui>,
    handlers: Mutex<Vec<Handler>>,
    deleted: AtomicBool,
    conn: Weak<Connection>,
}

impl Element {
    pub(crate) fn new(jid: Jid, ui: Arc<dyn Ui>, conn: Weak<Connection>) -> Self {
        Self {
            jid,
            ui,
            handlers: Mutex::new(Vec::new()),
            deleted: AtomicBool::new(false),
            conn,
        }
    }

    pub fn jid(&self) -> Jid {
        self.jid
    }

    pub fn ui(&self) -> &Arc<dyn Ui> {
        &self.ui
    }

    /// The owning connection, unless it has been dropped.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Append handlers consulted after the UI object's own capabilities.
    pub fn add_handlers(&self, handlers: impl IntoIterator<Item = Handler>) {
        if !self.is_deleted() {
            self.handlers.lock().extend(handlers);
        }
    }

    pub(crate) fn handlers(&self) -> Vec<Handler> {
        self.handlers.lock().clone()
    }

    /// Run the UI object's update hook.
    pub fn update(&self) {
        if !self.is_deleted() {
            self.ui.update(self);
        }
    }

    /// Add tags to this element.
    pub fn tag(&self, tags: impl Into<TagValue>) -> Result<()> {
        match self.live_connection() {
            Some(conn) => conn.tag(self, &tags.into()),
            None => Ok(()),
        }
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.live_connection()
            .is_some_and(|conn| conn.has_tag(self, tag))
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.live_connection()
            .map(|conn| conn.tags_of(self))
            .unwrap_or_default()
    }

    /// Mark `tags` dirty on this element's connection and every keyed
    /// connection of the hub, including pages whose WebSocket is not up yet.
    pub fn dirty(&self, tags: impl Into<TagValue>) {
        if let Some(conn) = self.live_connection() {
            conn.dirty(&tags.into());
        }
    }

    /// Marks `tags` dirty if `result` is a real change.
    ///
    /// Returns whether anything was marked. [`TagwireError::ValueUnchanged`]
    /// is not an error here.
    pub fn maybe_dirty(&self, tags: impl Into<TagValue>, result: Result<()>) -> Result<bool> {
        match result {
            Ok(()) => {
                self.dirty(tags);
                Ok(true)
            }
            Err(err) if err.is_value_unchanged() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn live_connection(&self) -> Option<Arc<Connection>> {
        if self.is_deleted() {
            None
        } else {
            self.conn.upgrade()
        }
    }

    fn queue(&self, what: What, data: impl Into<String>) {
        if let Some(conn) = self.live_connection() {
            conn.queue(WireMessage::new(what, self.jid, data));
        }
    }

    pub fn set_inner(&self, html: impl Into<String>) {
        self.queue(What::Inner, html);
    }

    pub fn set_attr(&self, attr: &str, value: &str) {
        self.queue(What::SetAttr, format!("{attr}\n{value}"));
    }

    pub fn remove_attr(&self, attr: &str) {
        self.queue(What::RemoveAttr, attr);
    }

    pub fn set_class(&self, class: &str) {
        self.queue(What::SetClass, class);
    }

    pub fn remove_class(&self, class: &str) {
        self.queue(What::RemoveClass, class);
    }

    /// Set the current value of an input element, in textual form.
    pub fn set_value(&self, value: impl Into<String>) {
        self.queue(What::Value, value);
    }

    /// Replace the whole DOM node. The new HTML must carry this element's id.
    pub fn replace(&self, html: impl Into<String>) -> Result<()> {
        if self.is_deleted() {
            return Ok(());
        }
        let html = html.into();
        let expected = self.jid.id_attr();
        if !html.contains(&expected) {
            return Err(TagwireError::ReplaceMissingId { expected });
        }
        self.queue(What::Replace, html);
        Ok(())
    }

    /// Append a child node.
    pub fn append(&self, html: impl Into<String>) {
        self.queue(What::Append, html);
    }

    /// Reorder the listed elements in the browser.
    pub fn order(&self, jids: &[Jid]) {
        if jids.is_empty() {
            return;
        }
        let list = jids
            .iter()
            .map(Jid::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.queue(What::Order, list);
    }

    /// Ask the browser to remove the child with the given HTML id.
    pub fn remove(&self, html_id: &str) {
        self.queue(What::Remove, html_id);
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("jid", &self.jid)
            .field("ui", &self.ui.type_name())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
