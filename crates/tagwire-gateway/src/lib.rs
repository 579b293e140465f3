//! Server-driven UI engine.
//!
//! Each rendered page gets a [`Connection`] holding its elements, indexed by
//! tag. Application code marks tags dirty or broadcasts through the [`Hub`];
//! each connection's event loop re-renders the affected elements and streams
//! compact wire messages to the browser over a WebSocket, while browser
//! events come back to the elements' handlers.

pub mod connection;
pub mod element;
pub mod event;
pub mod hub;
pub mod metrics;
mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod tag;
pub mod ws;

pub use connection::{ConnectFn, Connection, InitialRequest, LoopState};
pub use element::{ClickHandler, Element, EventHandler, Handler, Ui};
pub use hub::{Dest, Hub, Message};
pub use server::{initial_request, router, start_gateway};
pub use session::{Session, SessionCookie, SessionManager};
pub use state::GatewayState;
pub use tag::{Tag, TagProvider, TagValue};
