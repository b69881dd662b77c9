//! Metrics & the in-memory connection registry backing `/conns`: a
//! Prometheus recorder handle, a `DashMap`-backed registry of live
//! connections, and the reload-signal plumbing the admin API's `/reload`
//! endpoint feeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs the process-wide Prometheus recorder for the `metrics` crate's
/// macros (`counter!`, `gauge!`, ...) and returns the handle used to render
/// the exposition text. Call once at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().context("metrics: install Prometheus recorder")
}

/// One live TCP connection or UDP session, as shown by `/conns`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub id: String,
    pub protocol: String,
    pub client: String,
    pub dst: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct ConnRegistry {
    conns: DashMap<String, ConnInfo>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self { conns: DashMap::new() }
    }

    pub fn add(&self, c: ConnInfo) {
        self.conns.insert(c.id.clone(), c);
    }

    pub fn remove(&self, id: &str) {
        self.conns.remove(id);
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        let mut out: Vec<ConnInfo> = self.conns.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub fn new_conn_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("c{n}")
}

/// Bumped by the admin API's `/reload` handler; the config-reload loop
/// watches it.
#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    pub seq: u64,
}

impl ReloadSignal {
    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

pub type SharedConns = Arc<ConnRegistry>;
pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
