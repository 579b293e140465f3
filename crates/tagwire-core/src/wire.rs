//! Line-oriented wire protocol shared with the browser runtime.
//!
//! Every message is one line:
//!
//! ```text
//! <What> TAB <target> TAB <payload> LF
//! ```
//!
//! The target is empty for connection-wide messages, `Jid.<n>` for a registered
//! element, or an opaque HTML id. The payload is a JSON string literal, except
//! for kinds with a literal payload ([`What::has_literal_payload`]) which carry
//! raw JSON text. The quoting is the browser's `JSON.stringify`/`JSON.parse`.

use std::fmt;

use crate::jid::{Jid, PREFIX};
use crate::what::What;

/// Where a wire message is delivered in the browser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Connection-wide, or not addressed to any element.
    None,
    /// A registered element.
    Jid(Jid),
    /// A raw HTML id outside the element registry.
    Html(String),
}

impl Target {
    fn parse(s: &str) -> Option<Target> {
        if s.is_empty() {
            Some(Target::None)
        } else if s.starts_with(PREFIX) {
            Jid::parse(s).map(Target::Jid)
        } else {
            Some(Target::Html(s.to_string()))
        }
    }

    /// Flush ordering: HTML ids first, then connection-wide, then ascending Jid.
    pub fn order_key(&self) -> (u8, u64) {
        match self {
            Target::Html(_) => (0, 0),
            Target::None => (1, 0),
            Target::Jid(jid) => (2, jid.get()),
        }
    }

    pub fn jid(&self) -> Option<Jid> {
        match self {
            Target::Jid(jid) => Some(*jid),
            _ => None,
        }
    }

    fn is_well_formed(&self) -> bool {
        match self {
            Target::Html(id) => {
                !id.is_empty() && !id.starts_with(PREFIX) && !id.contains(['\t', '\n'])
            }
            _ => true,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::None => Ok(()),
            Target::Jid(jid) => fmt::Display::fmt(jid, f),
            Target::Html(id) => f.write_str(id),
        }
    }
}

impl From<Jid> for Target {
    fn from(jid: Jid) -> Self {
        Target::Jid(jid)
    }
}

/// A single message exchanged over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub what: What,
    pub target: Target,
    pub data: String,
}

impl WireMessage {
    pub fn new(what: What, target: impl Into<Target>, data: impl Into<String>) -> Self {
        Self {
            what,
            target: target.into(),
            data: data.into(),
        }
    }

    /// A connection-wide message.
    pub fn broadcast(what: What, data: impl Into<String>) -> Self {
        Self::new(what, Target::None, data)
    }

    /// A `danger` alert carrying the HTML-escaped error text.
    pub fn alert_error(err: &dyn fmt::Display) -> Self {
        Self::broadcast(What::Alert, format!("danger\n{}", escape_html(&err.to_string())))
    }

    /// True if encoding then decoding yields this message again.
    pub fn is_well_formed(&self) -> bool {
        self.target.is_well_formed()
            && (!self.what.has_literal_payload() || !self.data.contains('\n'))
    }

    /// Append the encoded line to `buf`.
    ///
    /// Literal payloads are raw JSON, where a line feed can only be whitespace,
    /// so any line feed in one is written as a space.
    pub fn append_to(&self, buf: &mut String) {
        buf.push_str(self.what.as_str());
        buf.push('\t');
        if let Target::Html(id) = &self.target {
            push_escaped_id(buf, id);
        } else {
            use fmt::Write as _;
            let _ = write!(buf, "{}", self.target);
        }
        buf.push('\t');
        if self.what.has_literal_payload() {
            if self.data.contains('\n') {
                buf.push_str(&self.data.replace('\n', " "));
            } else {
                buf.push_str(&self.data);
            }
        } else {
            buf.push_str(&serde_json::Value::String(self.data.clone()).to_string());
        }
        buf.push('\n');
    }

    pub fn encode(&self) -> String {
        let mut buf = String::with_capacity(self.data.len() + 16);
        self.append_to(&mut buf);
        buf
    }

    /// Decode one line. Malformed input yields `None`; callers treat it as noise.
    pub fn decode(line: &str) -> Option<WireMessage> {
        let body = line.strip_suffix('\n')?;
        let (kind, rest) = body.split_once('\t')?;
        let (target, payload) = rest.split_once('\t')?;
        if payload.contains('\n') {
            return None;
        }
        let what = What::parse(kind)?;
        let target = Target::parse(target)?;
        let data = if !what.has_literal_payload() && payload.starts_with('"') {
            serde_json::from_str::<String>(payload).ok()?
        } else {
            payload.to_string()
        };
        Some(WireMessage { what, target, data })
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {:?}, {:?}}}", self.what, self.target.to_string(), self.data)
    }
}

fn push_escaped_id(buf: &mut String, id: &str) {
    for ch in id.chars() {
        match ch {
            '\t' | '\n' => buf.push(' '),
            ch => buf.push(ch),
        }
    }
}

/// Escape text for inclusion in HTML, matching the browser's expectations for alerts.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&#34;"),
            ch => out.push(ch),
        }
    }
    out
}
