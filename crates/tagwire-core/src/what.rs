//! Message kinds understood by the browser runtime.

use std::fmt;

/// The kind of a wire or broadcast message.
///
/// The wire names (see [`What::as_str`]) are shared with the browser runtime
/// and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum What {
    /// Run the update hook of the addressed elements.
    Update,
    /// Reload the page.
    Reload,
    /// Navigate to the URL in the payload.
    Redirect,
    /// Show an alert; payload is `level\ntext`.
    Alert,
    /// Re-order elements; payload is a space-separated Jid list.
    Order,
    /// Call a named browser function with a raw JSON argument.
    Call,
    /// Set a browser variable from a raw JSON value.
    Set,
    Inner,
    Delete,
    Replace,
    Remove,
    Insert,
    Append,
    SetAttr,
    RemoveAttr,
    SetClass,
    RemoveClass,
    Value,
    Input,
    Click,
    /// Synchronously invoke the event handlers of the addressed elements.
    Hook,
}

impl What {
    pub const ALL: [What; 21] = [
        What::Update,
        What::Reload,
        What::Redirect,
        What::Alert,
        What::Order,
        What::Call,
        What::Set,
        What::Inner,
        What::Delete,
        What::Replace,
        What::Remove,
        What::Insert,
        What::Append,
        What::SetAttr,
        What::RemoveAttr,
        What::SetClass,
        What::RemoveClass,
        What::Value,
        What::Input,
        What::Click,
        What::Hook,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            What::Update => "Update",
            What::Reload => "Reload",
            What::Redirect => "Redirect",
            What::Alert => "Alert",
            What::Order => "Order",
            What::Call => "Call",
            What::Set => "Set",
            What::Inner => "Inner",
            What::Delete => "Delete",
            What::Replace => "Replace",
            What::Remove => "Remove",
            What::Insert => "Insert",
            What::Append => "Append",
            What::SetAttr => "SAttr",
            What::RemoveAttr => "RAttr",
            What::SetClass => "SClass",
            What::RemoveClass => "RClass",
            What::Value => "Value",
            What::Input => "Input",
            What::Click => "Click",
            What::Hook => "Hook",
        }
    }

    /// Parse a wire name. Exact matches win over case-insensitive ones.
    pub fn parse(s: &str) -> Option<What> {
        if s.is_empty() {
            return None;
        }
        Self::ALL
            .iter()
            .find(|w| w.as_str() == s)
            .or_else(|| Self::ALL.iter().find(|w| w.as_str().eq_ignore_ascii_case(s)))
            .copied()
    }

    /// Kinds that address the whole connection rather than individual elements.
    pub fn is_connection_wide(self) -> bool {
        matches!(self, What::Reload | What::Redirect | What::Order | What::Alert)
    }

    /// Kinds whose payload is raw JSON and is written to the wire unquoted.
    pub fn has_literal_payload(self) -> bool {
        matches!(self, What::Set | What::Call)
    }

    /// Kinds the browser sends that are routed to the event-call worker.
    pub fn is_event(self) -> bool {
        matches!(self, What::Input | What::Click | What::Set)
    }
}

impl fmt::Display for What {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
