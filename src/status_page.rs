//! Read-only HTML/JSON view of the current state.

use crate::bus::{LinkMonitor, LinkState};
use crate::register_map::RegisterMap;
use crate::state_store::{NormalizedState, StateStore};
use axum::{extract::State, response::Html, routing::get, Json, Router};
use serde_derive::Serialize;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct StatusPage {
    store: StateStore,
    link: LinkMonitor,
    map: Arc<RegisterMap>,
    refresh: Duration,
}

#[derive(Serialize)]
struct StatusView {
    device: NormalizedState,
    bus: LinkState,
}

impl StatusPage {
    pub fn new(
        store: StateStore,
        link: LinkMonitor,
        map: Arc<RegisterMap>,
        refresh: Duration,
    ) -> Self {
        Self {
            store,
            link,
            map,
            refresh,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/api/state", get(state_json))
            .with_state(self)
    }

    /// Serves the page until the listener fails.
    pub async fn serve(self, listen: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(listen).await?;
        info!(address = %listen, "status page listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn index(State(page): State<StatusPage>) -> Html<String> {
    Html(render(
        &page.map,
        &page.store.read(),
        page.link.state(),
        page.refresh,
    ))
}

async fn state_json(State(page): State<StatusPage>) -> Json<StatusView> {
    Json(StatusView {
        device: page.store.read(),
        bus: page.link.state(),
    })
}

/// Renders one snapshot as a self-refreshing HTML page.
pub fn render(
    map: &RegisterMap,
    state: &NormalizedState,
    bus: LinkState,
    refresh: Duration,
) -> String {
    let mut html = String::new();
    let device = escape(&map.device().name);
    let _ = write!(
        html,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"{}\"><title>{device}</title></head><body>",
        refresh.as_secs()
    );
    let _ = write!(
        html,
        "<h1>{device}</h1><p>Device: <b>{}</b> | Bus: <b>{:?}</b> | polls ok {} / failed {}</p>",
        if state.online { "online" } else { "offline" },
        bus,
        state.successful_polls,
        state.failed_polls
    );
    if let Some(error) = &state.last_error {
        let _ = write!(html, "<p>Last error: {}</p>", escape(error));
    }

    html.push_str("<table><tr><th>Metric</th><th>Value</th><th>Unit</th></tr>");
    for metric in &state.metrics.metrics {
        let (label, unit) = map
            .metric(&metric.name)
            .map(|spec| (spec.display_name.as_str(), spec.unit.as_str()))
            .unwrap_or((metric.name.as_str(), ""));
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(label),
            metric.value,
            escape(unit)
        );
    }
    for signal in &state.metrics.signals {
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td></td></tr>",
            escape(&signal.name),
            signal.state.payload()
        );
    }
    html.push_str("</table><h2>Raw registers</h2><table><tr><th>Register</th><th>Raw</th></tr>");
    for (register, raw) in &state.raw {
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{raw}</td></tr>",
            escape(register)
        );
    }
    html.push_str("</table></body></html>");
    html
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
