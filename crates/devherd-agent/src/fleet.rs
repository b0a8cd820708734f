use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use devherd_model::{AppSpec, ServerEntry};
use tokio::sync::{Mutex, mpsc, watch};

use crate::{
    probe::{HealthProber, ProxyHealth},
    settings::{HostSettings, Settings},
    terminate::{TerminationReport, TerminationTarget, Terminator},
};

/// An up/down transition seen by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetEvent {
    pub at: chrono::DateTime<chrono::Local>,
    pub text: String,
}

impl std::fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.at.format("%H:%M:%S"), self.text)
    }
}

pub fn format_uptime(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Summary line for a proxy `/health` body.
pub fn health_detail(body: &str) -> String {
    fn parse(body: &str) -> Option<String> {
        let v: serde_json::Value = serde_json::from_str(body).ok()?;
        let obj = v.as_object()?;
        let mut parts = Vec::new();
        match obj.get("sessionId") {
            Some(serde_json::Value::String(s)) if !s.is_empty() && s != "null" => {
                parts.push(format!("Session: {s}"));
            }
            Some(serde_json::Value::String(_) | serde_json::Value::Null) | None => {}
            Some(other) => parts.push(format!("Session: {other}")),
        }
        if let Some(n) = obj.get("requestCount") {
            parts.push(format!("Req: {}", n.as_i64()?));
        }
        if let Some(n) = obj.get("uptime") {
            parts.push(format_uptime(n.as_u64()?));
        }
        if parts.is_empty() {
            return Some("Healthy".to_string());
        }
        Some(parts.join(" | "))
    }
    parse(body).unwrap_or_else(|| "Healthy (parse error)".to_string())
}

/// Proxy entry, configured apps, then scan ports not already covered.
pub fn build_entries(
    apps: &[AppSpec],
    proxy_name: &str,
    proxy_port: u16,
    scan: &[u16],
) -> Vec<ServerEntry> {
    let mut entries = vec![ServerEntry::proxy(proxy_name, proxy_port)];
    entries.extend(apps.iter().map(ServerEntry::configured));
    let mut known: BTreeSet<u16> = entries.iter().map(|e| e.port).collect();
    for &port in scan {
        if known.insert(port) {
            entries.push(ServerEntry::discovered(port));
        }
    }
    entries
}

struct FleetState {
    entries: Mutex<Vec<ServerEntry>>,
    paused: AtomicBool,
    snapshot: watch::Sender<Vec<ServerEntry>>,
    events: mpsc::UnboundedSender<FleetEvent>,
}

#[derive(Clone)]
pub struct FleetMonitor {
    state: Arc<FleetState>,
    prober: HealthProber,
    terminator: Terminator,
    host: HostSettings,
    proxy_name: String,
    proxy_port: u16,
    scan_ports: Vec<u16>,
    interval: Duration,
}

impl FleetMonitor {
    pub fn new(
        apps: &[AppSpec],
        settings: &Settings,
        prober: HealthProber,
        terminator: Terminator,
    ) -> (Self, mpsc::UnboundedReceiver<FleetEvent>) {
        let entries = build_entries(
            apps,
            &settings.proxy.name,
            settings.proxy.port,
            &settings.fleet.scan_ports,
        );
        let (snapshot, _) = watch::channel(entries.clone());
        let (events, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            state: Arc::new(FleetState {
                entries: Mutex::new(entries),
                paused: AtomicBool::new(false),
                snapshot,
                events,
            }),
            prober,
            terminator,
            host: settings.host.clone(),
            proxy_name: settings.proxy.name.clone(),
            proxy_port: settings.proxy.port,
            scan_ports: settings.fleet.scan_ports.clone(),
            interval: settings.timings.monitor_interval(),
        };
        (monitor, rx)
    }

    /// Replaces the entry list after a configuration change.
    pub async fn rebuild(&self, apps: &[AppSpec]) {
        let entries = build_entries(apps, &self.proxy_name, self.proxy_port, &self.scan_ports);
        *self.state.entries.lock().await = entries.clone();
        self.state.snapshot.send_replace(entries);
    }

    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    /// Published once per completed cycle.
    pub fn snapshot(&self) -> watch::Receiver<Vec<ServerEntry>> {
        self.state.snapshot.subscribe()
    }

    /// Entries to show: discovered ports only while they respond.
    pub fn visible(&self) -> Vec<ServerEntry> {
        self.state
            .snapshot
            .borrow()
            .iter()
            .filter(|e| e.is_visible())
            .cloned()
            .collect()
    }

    async fn probe(&self, entry: &ServerEntry) -> (bool, String) {
        if entry.is_proxy {
            return match self.prober.proxy_health(entry.port).await {
                ProxyHealth::Body(body) => (true, health_detail(&body)),
                ProxyHealth::Status(code) => (true, format!("HTTP {code}")),
                ProxyHealth::Down => (false, "Not responding".to_string()),
            };
        }
        match self.prober.http_status(entry.port).await {
            Some(code) if (200..500).contains(&code) => (true, format!("HTTP {code}")),
            Some(_) | None => (false, "Not responding".to_string()),
        }
    }

    /// One pass over every entry, then a snapshot.
    pub async fn poll_once(&self) -> Vec<ServerEntry> {
        let mut entries = self.state.entries.lock().await.clone();
        for entry in entries.iter_mut() {
            let was_running = entry.running;
            let (running, detail) = self.probe(entry).await;
            entry.running = running;
            entry.detail = detail;
            if was_running != running {
                let text = format!(
                    "{}:{} {}",
                    entry.name,
                    entry.port,
                    if running { "UP" } else { "DOWN" }
                );
                tracing::info!(port = entry.port, name = %entry.name, running, "server state changed");
                let _ = self.state.events.send(FleetEvent {
                    at: chrono::Local::now(),
                    text,
                });
            }
        }
        *self.state.entries.lock().await = entries.clone();
        self.state.snapshot.send_replace(entries.clone());
        entries
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if !self.is_paused() {
                    self.poll_once().await;
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    /// Does not wait for the port to go down; the next cycle shows it.
    pub async fn stop(&self, entry: &ServerEntry) -> TerminationReport {
        let target = if entry.is_proxy {
            TerminationTarget::proxy(entry.port)
        } else {
            let dir = entry
                .project_path
                .as_deref()
                .map(|p| self.host.project_dir(p));
            TerminationTarget::primary(entry.port, dir)
        };
        tracing::info!(port = entry.port, name = %entry.name, "stop requested");
        self.terminator.terminate(&target).await
    }
}
