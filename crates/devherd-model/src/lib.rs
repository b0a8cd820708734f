use specta::Type;

/// Offset between an app's port and the port of its log helper.
pub const LOG_PORT_OFFSET: u16 = 10_000;

/// Highest port a log helper may be placed on.
pub const MAX_LOG_PORT: u16 = 65_530;

/// Port the log helper of an app listening on `port` serves from.
pub fn log_port_for(port: u16) -> u16 {
    let shifted = u32::from(port) + u32::from(LOG_PORT_OFFSET);
    shifted.min(u32::from(MAX_LOG_PORT)) as u16
}

fn default_dev_command() -> String {
    "npm run dev".to_string()
}

/// Companion proxy requirement of an app.
///
/// `"none"` (or empty) means the app runs alone; any other name implies the
/// secondary proxy must be restarted and reachable before the app is ready.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(transparent)]
pub struct ProxyMode(pub String);

impl ProxyMode {
    pub fn none() -> Self {
        Self("none".to_string())
    }

    pub fn requires_proxy(&self) -> bool {
        let mode = self.0.trim();
        !(mode.is_empty() || mode.eq_ignore_ascii_case("none"))
    }
}

impl Default for ProxyMode {
    fn default() -> Self {
        Self::none()
    }
}

/// One configured development app.
///
/// Owned by the configuration collaborator and passed by value into a launch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub project_path: String,
    pub port: u16,
    #[serde(default = "default_dev_command")]
    pub dev_command: String,
    #[serde(default, alias = "voicePortalMode")]
    pub proxy_mode: ProxyMode,
    /// 0 disables the idle watchdog.
    #[serde(default, alias = "idleTimeoutMin")]
    pub idle_timeout_minutes: u32,
}

impl AppSpec {
    pub fn needs_proxy(&self) -> bool {
        self.proxy_mode.requires_proxy()
    }

    pub fn log_port(&self) -> u16 {
        log_port_for(self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct LaunchId(pub String);

impl LaunchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of one launch attempt. Only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
pub enum LaunchState {
    Idle,
    SettingUp,
    StartingPrimary,
    StartingSecondary,
    WaitingForReadiness,
    Ready,
    Failed,
}

impl LaunchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LaunchState::Ready | LaunchState::Failed)
    }

    /// Whether a session in `self` may move to `next`.
    pub fn can_advance_to(self, next: LaunchState) -> bool {
        !self.is_terminal() && next > self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Launcher,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn launcher(text: impl Into<String>) -> Self {
        Self {
            source: LogSource::Launcher,
            text: text.into(),
        }
    }

    pub fn server(text: impl Into<String>) -> Self {
        Self {
            source: LogSource::Server,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source {
            LogSource::Launcher => f.write_str(&self.text),
            LogSource::Server => write!(f, "[srv] {}", self.text),
        }
    }
}

/// Discrete, already-formed message posted from a launch worker to its consumer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LaunchEvent {
    StartingPrimary,
    StartingSecondary,
    Waiting,
    Ready,
    Error { message: String },
    Log(LogLine),
}

/// One row of the fleet monitor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerEntry {
    pub name: String,
    pub port: u16,
    pub is_proxy: bool,
    pub project_path: Option<String>,
    /// Scan-set port not covered by configuration.
    pub is_discovered: bool,
    pub running: bool,
    pub detail: String,
}

impl ServerEntry {
    pub fn proxy(name: impl Into<String>, port: u16) -> Self {
        Self::new(name.into(), port, true, None, false)
    }

    pub fn configured(app: &AppSpec) -> Self {
        Self::new(
            app.name.clone(),
            app.port,
            false,
            Some(app.project_path.clone()),
            false,
        )
    }

    pub fn discovered(port: u16) -> Self {
        Self::new("Discovered".to_string(), port, false, None, true)
    }

    fn new(
        name: String,
        port: u16,
        is_proxy: bool,
        project_path: Option<String>,
        is_discovered: bool,
    ) -> Self {
        Self {
            name,
            port,
            is_proxy,
            project_path,
            is_discovered,
            running: false,
            detail: String::new(),
        }
    }

    /// Discovered entries are only shown while they respond.
    pub fn is_visible(&self) -> bool {
        !self.is_discovered || self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_port_is_offset_and_capped() {
        assert_eq!(log_port_for(5173), 15173);
        assert_eq!(log_port_for(55530), 65530);
        assert_eq!(log_port_for(60000), 65530);
        assert_eq!(log_port_for(u16::MAX), 65530);
    }

    #[test]
    fn proxy_mode_none_and_empty_do_not_require_proxy() {
        assert!(!ProxyMode::none().requires_proxy());
        assert!(!ProxyMode(String::new()).requires_proxy());
        assert!(!ProxyMode("None".to_string()).requires_proxy());
        assert!(ProxyMode("default".to_string()).requires_proxy());
    }

    #[test]
    fn app_spec_reads_camel_case_mapping_with_defaults() {
        let json = r#"{"id":"web","name":"Web","projectPath":"projekty/web","port":5173}"#;
        let app: AppSpec = serde_json::from_str(json).unwrap();
        assert_eq!(app.dev_command, "npm run dev");
        assert_eq!(app.idle_timeout_minutes, 0);
        assert!(!app.needs_proxy());
        assert_eq!(app.log_port(), 15173);

        let legacy = r#"{"id":"vp","name":"VP","projectPath":"vp","port":8080,
            "voicePortalMode":"default","idleTimeoutMin":60}"#;
        let app: AppSpec = serde_json::from_str(legacy).unwrap();
        assert!(app.needs_proxy());
        assert_eq!(app.idle_timeout_minutes, 60);
    }

    #[test]
    fn launch_state_only_moves_forward() {
        use LaunchState::*;
        assert!(Idle.can_advance_to(SettingUp));
        assert!(SettingUp.can_advance_to(WaitingForReadiness));
        assert!(!StartingPrimary.can_advance_to(SettingUp));
        assert!(!Ready.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Ready));
    }

    #[test]
    fn server_lines_are_tagged() {
        assert_eq!(LogLine::server("listening").to_string(), "[srv] listening");
        assert_eq!(LogLine::launcher("CMD: x").to_string(), "CMD: x");
    }

    #[test]
    fn discovered_entries_hide_while_down() {
        let mut e = ServerEntry::discovered(3000);
        assert!(!e.is_visible());
        e.running = true;
        assert!(e.is_visible());
        assert!(ServerEntry::proxy("Proxy", 3456).is_visible());
    }

    #[test]
    fn launch_id_is_non_empty() {
        assert!(!LaunchId::new().0.is_empty());
    }
}
