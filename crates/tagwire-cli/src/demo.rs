//! The demo page: a counter shared by every visitor, a per-session visit
//! count, and a clock that ticks on every open page.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tagwire_core::{Result, TagwireError};
use tagwire_gateway::{ClickHandler, Connection, Element, GatewayState, Hub, SessionCookie, Tag, Ui, initial_request};
use tracing::{debug, error};

const COUNTER_TAG: &str = "counter";
const CLOCK_TAG: &str = "clock";

/// Shared click counter. Every page renders the same instance.
#[derive(Default)]
pub struct Counter {
    count: AtomicI64,
}

impl Ui for Counter {
    fn update(&self, elem: &Element) {
        elem.set_inner(self.count.load(Ordering::SeqCst).to_string());
    }

    fn as_click_handler(&self) -> Option<&dyn ClickHandler> {
        Some(self)
    }
}

impl ClickHandler for Counter {
    fn on_click(&self, elem: &Element, name: &str) -> Result<()> {
        let delta = match name {
            "inc" => 1,
            "dec" => -1,
            _ => return Err(TagwireError::EventUnhandled),
        };
        self.count.fetch_add(delta, Ordering::SeqCst);
        elem.dirty(Tag::name(COUNTER_TAG));
        Ok(())
    }
}

/// Uptime display.
pub struct Clock {
    started: Instant,
}

impl Ui for Clock {
    fn update(&self, elem: &Element) {
        let secs = self.started.elapsed().as_secs();
        elem.set_inner(format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60));
    }
}

struct Demo {
    gateway: Arc<GatewayState>,
    counter: Arc<Counter>,
    clock: Arc<Clock>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    let demo = Arc::new(Demo {
        gateway: state,
        counter: Arc::new(Counter::default()),
        clock: Arc::new(Clock {
            started: Instant::now(),
        }),
    });
    Router::new().route("/", get(index)).with_state(demo)
}

/// Mark the clock dirty once a second until the hub closes.
pub async fn run_clock(hub: Arc<Hub>) {
    let shutdown = hub.shutdown_token();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => hub.dirty(&Tag::name(CLOCK_TAG).into()),
        }
    }
}

async fn index(
    State(demo): State<Arc<Demo>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    match render(&demo, addr, &headers, &uri) {
        Ok((html, cookie)) => ([(header::SET_COOKIE, cookie.to_string())], Html(html)).into_response(),
        Err(err) => {
            error!(error = %err, "rendering demo page failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn render(demo: &Demo, addr: SocketAddr, headers: &HeaderMap, uri: &Uri) -> Result<(String, SessionCookie)> {
    let initial = initial_request(headers, uri, addr);
    let cookie_header = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
    let (session, cookie) =
        demo.gateway
            .sessions
            .ensure_session(cookie_header, initial.remote_ip, initial.secure);
    let visits = session.get("visits").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
    session.set("visits", json!(visits));

    let conn = demo.gateway.new_connection(initial, Some(session));
    conn.set_rendering();
    conn.set_connect_fn(Some(Arc::new(|conn: &Connection| {
        debug!(conn = %conn.key_string(), "demo page connected");
        Ok(())
    })));

    let counter = conn.register(demo.counter.clone(), Tag::name(COUNTER_TAG))?;
    let clock = conn.register(demo.clock.clone(), Tag::name(CLOCK_TAG))?;
    counter.set_attr("title", &format!("visit {visits}"));
    if visits > 1 {
        counter.set_class("returning");
    }

    let count = demo.counter.count.load(Ordering::SeqCst);
    let html = format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
{head}
<title>tagwire demo</title>
</head>
<body>
<div id="alerts"></div>
<h1>Counter: <span {counter_id}>{count}</span></h1>
<button name="dec" data-jid="{counter_jid}">-</button>
<button name="inc" data-jid="{counter_jid}">+</button>
<p>Visits this session: {visits}</p>
<p>Uptime: <span {clock_id}></span></p>
<script>{CLIENT_JS}</script>{tail}
</body>
</html>
"#,
        head = conn.head_html(),
        counter_id = counter.jid().id_attr(),
        counter_jid = counter.jid(),
        clock_id = clock.jid().id_attr(),
        tail = conn.tail_html(),
    );
    Ok((html, cookie))
}

/// Just enough browser runtime to apply the demo's updates and report clicks.
const CLIENT_JS: &str = r#"
(function () {
  var key = document.querySelector('meta[name="tagwire"]').content;
  var scheme = location.protocol === "https:" ? "wss://" : "ws://";
  var ws = new WebSocket(scheme + location.host + "/tagwire/" + key);
  function unquote(s) { return s.charAt(0) === '"' ? JSON.parse(s) : s; }
  function split(s) { var i = s.indexOf("\n"); return [s.slice(0, i), s.slice(i + 1)]; }
  ws.onmessage = function (ev) {
    ev.data.split("\n").forEach(function (line) {
      var parts = line.split("\t");
      if (parts.length < 3) return;
      var el = parts[1] ? document.getElementById(parts[1]) : null;
      var data = unquote(parts.slice(2).join("\t"));
      switch (parts[0]) {
        case "Reload": location.reload(); break;
        case "Redirect": location.assign(data); break;
        case "Alert": var a = split(data);
          document.getElementById("alerts").innerHTML = '<div class="alert-' + a[0] + '">' + a[1] + "</div>"; break;
        case "Inner": if (el) el.innerHTML = data; break;
        case "Value": if (el) el.value = data; break;
        case "SClass": if (el) el.classList.add(data); break;
        case "RClass": if (el) el.classList.remove(data); break;
        case "SAttr": if (el) { var kv = split(data); el.setAttribute(kv[0], kv[1]); } break;
        case "RAttr": if (el) el.removeAttribute(data); break;
        case "Delete": if (el) el.remove(); break;
      }
    });
  };
  document.addEventListener("click", function (ev) {
    var b = ev.target.closest("[data-jid]");
    if (!b || ws.readyState !== 1) return;
    ws.send("Click\t" + b.dataset.jid + "\t" + JSON.stringify(b.name) + "\n");
  });
})();
"#;
