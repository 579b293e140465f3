//! Wire protocol, error taxonomy and configuration shared by the tagwire crates.

pub mod config;
pub mod error;
pub mod jid;
pub mod keys;
pub mod what;
pub mod wire;

pub use error::{Result, TagwireError};
pub use jid::Jid;
pub use what::What;
pub use wire::{Target, WireMessage};
