//! Event dispatch to element handlers.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tagwire_core::{Result, Target, TagwireError, What, WireMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::element::{Element, Handler};

/// A queued call to an element's handlers.
#[derive(Debug, Clone)]
pub struct EventCall {
    pub target: Target,
    pub what: What,
    pub data: String,
}

fn unhandled() -> Result<()> {
    Err(TagwireError::EventUnhandled)
}

fn call_ui(elem: &Element, what: What, value: &str) -> Result<()> {
    let ui = elem.ui();
    if what == What::Click {
        if let Some(h) = ui.as_click_handler() {
            match h.on_click(elem, value) {
                Err(err) if err.is_event_unhandled() => {}
                other => return other,
            }
        }
    }
    match ui.as_event_handler() {
        Some(h) => h.on_event(elem, what, value),
        None => unhandled(),
    }
}

fn call_handler(handler: &Handler, elem: &Element, what: What, value: &str) -> Result<()> {
    match handler {
        Handler::Event(h) => h.on_event(elem, what, value),
        Handler::Click(h) if what == What::Click => h.on_click(elem, value),
        Handler::Click(_) => unhandled(),
    }
}

fn call_chain(elem: &Element, what: What, value: &str) -> Result<()> {
    match call_ui(elem, what, value) {
        Err(err) if err.is_event_unhandled() => {}
        other => return other,
    }
    for handler in elem.handlers() {
        match call_handler(&handler, elem, what, value) {
            Err(err) if err.is_event_unhandled() => continue,
            other => return other,
        }
    }
    unhandled()
}

/// Run the element's handler chain: the UI object first, then any attached
/// handlers, stopping at the first that does not return
/// [`TagwireError::EventUnhandled`]. A panic in a handler is returned as
/// [`TagwireError::HandlerPanic`].
pub fn call_event_handlers(elem: &Element, what: What, value: &str) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| call_chain(elem, what, value))) {
        Ok(result) => result,
        Err(payload) => Err(panic_error(elem.ui().type_name(), payload)),
    }
}

fn panic_error(type_name: &'static str, payload: Box<dyn Any + Send>) -> TagwireError {
    let payload = match payload.downcast::<TagwireError>() {
        Ok(err) => {
            return TagwireError::HandlerPanic {
                type_name,
                message: err.to_string(),
                cause: Some(err),
            };
        }
        Err(payload) => payload,
    };
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    TagwireError::HandlerPanic {
        type_name,
        message,
        cause: None,
    }
}

/// Start the event-call worker for `conn`.
///
/// Calls run one at a time, in arrival order. Each handler runs on a
/// blocking thread borrowed for that call only, so it may take locks and
/// call back into the connection without stalling the event loop, and an
/// idle connection holds no thread. Errors are sent straight to the
/// outbound queue as alerts. The worker exits once `rx` is closed and
/// drained.
pub(crate) fn spawn_event_worker(
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<EventCall>,
    outbound: mpsc::Sender<WireMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            if conn.is_cancelled() {
                continue;
            }
            let what = call.what;
            let handler_conn = conn.clone();
            let result = tokio::task::spawn_blocking(move || {
                handler_conn.call_all_event_handlers(&call.target, call.what, &call.data)
            })
            .await
            .unwrap_or_else(|err| Err(anyhow::Error::new(err).into()));
            if let Err(err) = result {
                warn!(conn = %conn.key_string(), %what, error = %err, "event handler failed");
                crate::metrics::record_error(err.kind());
                if outbound.try_send(WireMessage::alert_error(&err)).is_err() {
                    warn!(conn = %conn.key_string(), error = %err, "outbound queue full sending event error");
                }
            }
        }
        debug!(conn = %conn.key_string(), "event worker done");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Ui;
    use crate::hub::Hub;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        click_result: Mutex<Option<fn() -> Result<()>>>,
    }

    impl Ui for Recorder {
        fn update(&self, _elem: &Element) {}

        fn as_click_handler(&self) -> Option<&dyn crate::element::ClickHandler> {
            Some(self)
        }
    }

    impl crate::element::ClickHandler for Recorder {
        fn on_click(&self, _elem: &Element, name: &str) -> Result<()> {
            self.seen.lock().push(format!("ui:{name}"));
            match *self.click_result.lock() {
                Some(f) => f(),
                None => Ok(()),
            }
        }
    }

    struct Plain;

    impl Ui for Plain {
        fn update(&self, _elem: &Element) {}
    }

    struct Panics;

    impl Ui for Panics {
        fn update(&self, _elem: &Element) {}

        fn as_event_handler(&self) -> Option<&dyn crate::element::EventHandler> {
            Some(self)
        }
    }

    impl crate::element::EventHandler for Panics {
        fn on_event(&self, _elem: &Element, _what: What, _value: &str) -> Result<()> {
            panic!("boom");
        }
    }

    fn new_conn() -> Arc<Connection> {
        Connection::new(Arc::new(Hub::new()))
    }

    #[test]
    fn test_ui_click_handler_runs_first() {
        let conn = new_conn();
        let ui = Arc::new(Recorder::default());
        let elem = conn.new_element(ui.clone());
        let extra = Arc::new(Mutex::new(0));
        let counter = extra.clone();
        elem.add_handlers([Handler::click(move |_, _| {
            *counter.lock() += 1;
            Ok(())
        })]);

        call_event_handlers(&elem, What::Click, "save").unwrap();
        assert_eq!(*ui.seen.lock(), vec!["ui:save".to_string()]);
        assert_eq!(*extra.lock(), 0);
    }

    #[test]
    fn test_unhandled_falls_through_to_attached_handlers() {
        let conn = new_conn();
        let ui = Arc::new(Recorder::default());
        *ui.click_result.lock() = Some(unhandled);
        let elem = conn.new_element(ui.clone());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h1 = hits.clone();
        let h2 = hits.clone();
        elem.add_handlers([
            Handler::event(move |_, what, value| {
                h1.lock().push(format!("{what}:{value}"));
                Err(TagwireError::EventUnhandled)
            }),
            Handler::click(move |_, name| {
                h2.lock().push(format!("click:{name}"));
                Ok(())
            }),
        ]);

        call_event_handlers(&elem, What::Click, "go").unwrap();
        assert_eq!(*hits.lock(), vec!["Click:go".to_string(), "click:go".to_string()]);
    }

    #[test]
    fn test_no_handlers_is_unhandled() {
        let conn = new_conn();
        let elem = conn.new_element(Arc::new(Plain));
        let err = call_event_handlers(&elem, What::Input, "x").unwrap_err();
        assert!(err.is_event_unhandled());
    }

    #[test]
    fn test_click_handler_ignores_input() {
        let conn = new_conn();
        let elem = conn.new_element(Arc::new(Plain));
        elem.add_handlers([Handler::click(|_, _| Ok(()))]);
        let err = call_event_handlers(&elem, What::Input, "x").unwrap_err();
        assert!(err.is_event_unhandled());
    }

    #[test]
    fn test_panic_becomes_handler_panic() {
        let conn = new_conn();
        let elem = conn.new_element(Arc::new(Panics));
        let err = call_event_handlers(&elem, What::Input, "x").unwrap_err();
        match err {
            TagwireError::HandlerPanic { type_name, message, cause } => {
                assert!(type_name.ends_with("Panics"));
                assert_eq!(message, "boom");
                assert!(cause.is_none());
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_panic_with_error_payload_keeps_cause() {
        let conn = new_conn();
        let elem = conn.new_element(Arc::new(Plain));
        elem.add_handlers([Handler::event(|_, _, _| {
            std::panic::panic_any(TagwireError::ValueNotSettable)
        })]);
        let err = call_event_handlers(&elem, What::Input, "x").unwrap_err();
        assert_eq!(err.kind(), "handler_panic");
        assert_eq!(
            std::error::Error::source(&err).map(|e| e.to_string()),
            Some("value not settable".to_string())
        );
    }
}
