use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use devherd_model::AppSpec;

pub const DEFAULT_SCAN_PORTS: [u16; 16] = [
    3000, 3001, 4200, 5000, 5173, 5174, 8000, 8080, 8081, 8082, 8085, 8888, 8889, 9000, 9090,
    19876,
];

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Shell,
    Termux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Read the local process table and plan kills in-process.
    Procfs,
    /// Ship the whole strategy list as one composite script.
    Remote,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub home: PathBuf,
    pub state_dir: Option<PathBuf>,
    pub shell: String,
    pub gateway: GatewayKind,
    /// Runs before the dev command; `{project}` expands to the project dir.
    pub prelude: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            home: home_dir(),
            state_dir: None,
            shell: "bash".to_string(),
            gateway: GatewayKind::Shell,
            prelude: None,
        }
    }
}

impl HostSettings {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.home.join(".devherd"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    pub fn log_file(&self, app_id: &str) -> PathBuf {
        self.log_dir().join(format!("{app_id}.log"))
    }

    pub fn log_helper_path(&self) -> PathBuf {
        self.state_dir().join("logreader.py")
    }

    /// Relative project paths are resolved against `home`.
    pub fn project_dir(&self, project_path: &str) -> PathBuf {
        let p = Path::new(project_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.home.join(p)
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub name: String,
    pub port: u16,
    pub dir: Option<PathBuf>,
    /// `{project}` expands to the project dir of the app being launched.
    pub restart_command: String,
    pub process_patterns: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            name: "VoicePortal Proxy".to_string(),
            port: 3456,
            dir: None,
            restart_command: "bash voiceportal-daemon.sh --restart {project}".to_string(),
            process_patterns: vec![
                "node.*proxy/server.js".to_string(),
                "voiceportal-daemon".to_string(),
            ],
        }
    }
}

/// Every settle delay and interval the engine waits on.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Timings {
    pub setup_settle_ms: u64,
    pub primary_settle_ms: u64,
    pub secondary_settle_ms: u64,
    pub poll_interval_ms: u64,
    pub readiness_ceiling_ms: u64,
    pub log_fetch_every: u32,
    pub status_every: u32,
    pub watchdog_tick_ms: u64,
    pub monitor_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub tcp_timeout_ms: u64,
    pub log_fetch_timeout_ms: u64,
    pub kill_settle_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            setup_settle_ms: 500,
            primary_settle_ms: 2000,
            secondary_settle_ms: 1000,
            poll_interval_ms: 2000,
            readiness_ceiling_ms: 30_000,
            log_fetch_every: 3,
            status_every: 5,
            watchdog_tick_ms: 30_000,
            monitor_interval_ms: 3000,
            http_timeout_ms: 2000,
            tcp_timeout_ms: 1000,
            log_fetch_timeout_ms: 500,
            kill_settle_ms: 1000,
        }
    }
}

impl Timings {
    /// `DEVHERD_<FIELD>` env vars win over the file.
    pub fn apply_env(&mut self) {
        fn ms(name: &str, slot: &mut u64, lo: u64, hi: u64) {
            if let Some(v) = env_u64(name) {
                *slot = v.clamp(lo, hi);
            }
        }
        ms("DEVHERD_SETUP_SETTLE_MS", &mut self.setup_settle_ms, 0, 60_000);
        ms("DEVHERD_PRIMARY_SETTLE_MS", &mut self.primary_settle_ms, 0, 60_000);
        ms("DEVHERD_SECONDARY_SETTLE_MS", &mut self.secondary_settle_ms, 0, 60_000);
        ms("DEVHERD_POLL_INTERVAL_MS", &mut self.poll_interval_ms, 100, 60_000);
        ms("DEVHERD_READINESS_CEILING_MS", &mut self.readiness_ceiling_ms, 1000, 30 * 60 * 1000);
        ms("DEVHERD_WATCHDOG_TICK_MS", &mut self.watchdog_tick_ms, 1000, 10 * 60 * 1000);
        ms("DEVHERD_MONITOR_INTERVAL_MS", &mut self.monitor_interval_ms, 250, 60_000);
        ms("DEVHERD_HTTP_TIMEOUT_MS", &mut self.http_timeout_ms, 100, 30_000);
        ms("DEVHERD_TCP_TIMEOUT_MS", &mut self.tcp_timeout_ms, 100, 30_000);
        ms("DEVHERD_LOG_FETCH_TIMEOUT_MS", &mut self.log_fetch_timeout_ms, 100, 30_000);
        ms("DEVHERD_KILL_SETTLE_MS", &mut self.kill_settle_ms, 0, 60_000);
    }

    pub fn setup_settle(&self) -> Duration {
        Duration::from_millis(self.setup_settle_ms)
    }

    pub fn primary_settle(&self) -> Duration {
        Duration::from_millis(self.primary_settle_ms)
    }

    pub fn secondary_settle(&self) -> Duration {
        Duration::from_millis(self.secondary_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn readiness_ceiling(&self) -> Duration {
        Duration::from_millis(self.readiness_ceiling_ms)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn log_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.log_fetch_timeout_ms)
    }

    pub fn kill_settle(&self) -> Duration {
        Duration::from_millis(self.kill_settle_ms)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub scan_ports: Vec<u16>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            scan_ports: DEFAULT_SCAN_PORTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TerminationSettings {
    pub snapshot: SnapshotMode,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            snapshot: SnapshotMode::Procfs,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: HostSettings,
    pub proxy: ProxySettings,
    pub timings: Timings,
    pub fleet: FleetSettings,
    pub termination: TerminationSettings,
    pub apps: Vec<AppSpec>,
}

impl Settings {
    pub fn default_path() -> PathBuf {
        std::env::var_os("DEVHERD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".devherd").join("devherd.toml"))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let settings: Settings = toml::from_str(text).context("parse devherd config")?;
        settings.validate()?;
        Ok(settings)
    }

    /// A missing file yields the defaults with no apps.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("load {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Settings::default()
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        settings.timings.apply_env();
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for app in &self.apps {
            if app.id.trim().is_empty() {
                anyhow::bail!("app id must be non-empty (app {:?})", app.name);
            }
            if app.port == 0 {
                anyhow::bail!("app {}: port must be non-zero", app.id);
            }
            if !seen.insert(app.id.as_str()) {
                anyhow::bail!("duplicate app id: {}", app.id);
            }
        }
        Ok(())
    }

    pub fn app(&self, id: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|a| a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let text = r#"
[host]
home = "/data/home"
gateway = "termux"
prelude = "termux-fix-shebang {project}/node_modules/.bin/* 2>/dev/null"

[proxy]
port = 4000
dir = "/data/home/proxy"

[timings]
poll_interval_ms = 500

[termination]
snapshot = "remote"

[[apps]]
id = "web"
name = "Web"
projectPath = "projekty/web"
port = 5173
proxyMode = "default"
idleTimeoutMinutes = 15
"#;
        let s = Settings::parse(text).unwrap();
        assert_eq!(s.host.gateway, GatewayKind::Termux);
        assert_eq!(s.host.log_file("web"), PathBuf::from("/data/home/.devherd/logs/web.log"));
        assert_eq!(
            s.host.project_dir("projekty/web"),
            PathBuf::from("/data/home/projekty/web")
        );
        assert_eq!(s.host.project_dir("/srv/x"), PathBuf::from("/srv/x"));
        assert_eq!(s.proxy.port, 4000);
        assert_eq!(s.timings.poll_interval_ms, 500);
        assert_eq!(s.timings.readiness_ceiling_ms, 30_000);
        assert_eq!(s.termination.snapshot, SnapshotMode::Remote);
        let app = s.app("web").unwrap();
        assert!(app.needs_proxy());
        assert_eq!(app.idle_timeout_minutes, 15);
        assert_eq!(s.fleet.scan_ports.len(), DEFAULT_SCAN_PORTS.len());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let s = Settings::parse("").unwrap();
        assert!(s.apps.is_empty());
        assert_eq!(s.proxy.port, 3456);
        assert_eq!(s.timings.setup_settle(), Duration::from_millis(500));
        assert_eq!(s.termination.snapshot, SnapshotMode::Procfs);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let text = r#"
[[apps]]
id = "a"
name = "A"
projectPath = "a"
port = 3000

[[apps]]
id = "a"
name = "B"
projectPath = "b"
port = 3001
"#;
        let err = Settings::parse(text).unwrap_err();
        assert!(format_error_chain(&err).contains("duplicate app id: a"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join(format!("devherd-missing-{}.toml", uuid::Uuid::new_v4()));
        let s = Settings::load(&path).unwrap();
        assert!(s.apps.is_empty());
    }

    #[test]
    fn error_chain_is_flattened() {
        let err = anyhow::anyhow!("inner").context("outer");
        assert_eq!(format_error_chain(&err), "outer: inner");
    }
}
