use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use devherd_model::{AppSpec, LaunchEvent, LaunchId, LaunchState, LogLine, log_port_for};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    gateway::{CommandGateway, shell_quote},
    log_tail::{self, LogTail},
    probe::HealthProber,
    settings::Settings,
    watchdog::IdleWatchdogs,
};

const SERVER_LINES_PER_FETCH: usize = 5;
const SERVER_LINES_ON_FAILURE: usize = 15;

/// Which targets never answered before the readiness ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTimeout {
    pub primary_port: Option<u16>,
    pub secondary: Option<(String, u16)>,
    /// Last lines of the captured server log.
    pub output: Vec<String>,
    pub manual_command: String,
}

impl fmt::Display for ReadinessTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.primary_port, &self.secondary) {
            (Some(p), Some((_, s))) => {
                write!(f, "Dev server (port {p}) and proxy (port {s}) not responding.")?
            }
            (Some(p), None) => write!(f, "Dev server not responding on port {p}.")?,
            (None, Some((name, s))) => write!(f, "{name} not responding on port {s}.")?,
            (None, None) => f.write_str("Servers did not become ready.")?,
        }
        if self.output.is_empty() {
            write!(
                f,
                "\n\nNo server output captured.\nRun manually:\n  {}",
                self.manual_command
            )
        } else {
            f.write_str("\n\nServer output:\n")?;
            for line in &self.output {
                writeln!(f, "{line}")?;
            }
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchFailure {
    #[error(
        "Port {port} is in use by another process (not HTTP).\n\nChange the port in the app config,\nor kill the process:\n  fuser -k {port}/tcp"
    )]
    PortConflict { port: u16 },
    #[error("{0}")]
    NotReady(ReadinessTimeout),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Ready { already_running: bool },
    Failed(LaunchFailure),
    /// Stopped at a checkpoint; no error is surfaced.
    Cancelled,
}

/// One launch attempt. Never reused.
pub struct LaunchSession {
    pub id: LaunchId,
    pub app_id: String,
    pub log_port: u16,
    cancelled: AtomicBool,
    state: watch::Sender<LaunchState>,
    history: Mutex<Vec<LaunchState>>,
    log: Mutex<Vec<LogLine>>,
}

impl LaunchSession {
    fn new(app: &AppSpec) -> Self {
        let (state, _) = watch::channel(LaunchState::Idle);
        Self {
            id: LaunchId::new(),
            app_id: app.id.clone(),
            log_port: log_port_for(app.port),
            cancelled: AtomicBool::new(false),
            state,
            history: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Idempotent; observed at the next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LaunchState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LaunchState> {
        self.state.subscribe()
    }

    /// Every state entered so far, in order.
    pub async fn history(&self) -> Vec<LaunchState> {
        self.history.lock().await.clone()
    }

    pub async fn log_lines(&self) -> Vec<LogLine> {
        self.log.lock().await.clone()
    }

    async fn advance(&self, next: LaunchState) -> bool {
        let moved = self.state.send_if_modified(|cur| {
            if cur.can_advance_to(next) {
                *cur = next;
                true
            } else {
                false
            }
        });
        if moved {
            self.history.lock().await.push(next);
        }
        moved
    }
}

pub struct LaunchHandle {
    pub session: Arc<LaunchSession>,
    pub events: mpsc::UnboundedReceiver<LaunchEvent>,
    pub task: JoinHandle<LaunchOutcome>,
}

#[derive(Clone)]
pub struct Launcher {
    gateway: Arc<dyn CommandGateway>,
    prober: HealthProber,
    watchdogs: IdleWatchdogs,
    settings: Arc<Settings>,
}

impl Launcher {
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        prober: HealthProber,
        watchdogs: IdleWatchdogs,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            gateway,
            prober,
            watchdogs,
            settings,
        }
    }

    /// Starts a fresh session on its own worker.
    pub fn launch(&self, app: AppSpec) -> LaunchHandle {
        let session = Arc::new(LaunchSession::new(&app));
        let (tx, events) = mpsc::unbounded_channel();
        let run = LaunchRun {
            launcher: self.clone(),
            app,
            session: session.clone(),
            tx,
        };
        let task = tokio::spawn(run.run());
        LaunchHandle {
            session,
            events,
            task,
        }
    }
}

struct LaunchRun {
    launcher: Launcher,
    app: AppSpec,
    session: Arc<LaunchSession>,
    tx: mpsc::UnboundedSender<LaunchEvent>,
}

impl LaunchRun {
    fn emit(&self, event: LaunchEvent) {
        // A dropped consumer does not stop the launch.
        let _ = self.tx.send(event);
    }

    async fn log(&self, line: LogLine) {
        tracing::debug!(app_id = %self.app.id, line = %line, "launch log");
        self.session.log.lock().await.push(line.clone());
        self.emit(LaunchEvent::Log(line));
    }

    async fn say(&self, text: impl Into<String>) {
        self.log(LogLine::launcher(text)).await;
    }

    async fn enter(&self, state: LaunchState) {
        if !self.session.advance(state).await {
            return;
        }
        let event = match state {
            LaunchState::StartingPrimary => LaunchEvent::StartingPrimary,
            LaunchState::StartingSecondary => LaunchEvent::StartingSecondary,
            LaunchState::WaitingForReadiness => LaunchEvent::Waiting,
            LaunchState::Ready => LaunchEvent::Ready,
            LaunchState::Idle | LaunchState::SettingUp | LaunchState::Failed => return,
        };
        self.emit(event);
    }

    async fn fail(&self, failure: LaunchFailure) -> LaunchOutcome {
        tracing::warn!(app_id = %self.app.id, error = %failure, "launch failed");
        self.session.advance(LaunchState::Failed).await;
        self.emit(LaunchEvent::Error {
            message: failure.to_string(),
        });
        LaunchOutcome::Failed(failure)
    }

    async fn ready(&self, already_running: bool) -> LaunchOutcome {
        self.enter(LaunchState::Ready).await;
        tracing::info!(app_id = %self.app.id, port = self.app.port, already_running, "app ready");
        self.launcher.watchdogs.start(&self.app).await;
        LaunchOutcome::Ready { already_running }
    }

    /// Dispatch failures are reported as log lines only.
    async fn dispatch(&self, label: &str, command: &str, workdir: Option<PathBuf>) {
        match self
            .launcher
            .gateway
            .dispatch(command, workdir.as_deref())
            .await
        {
            Ok(()) => self.say("Intent sent OK").await,
            Err(e) => {
                tracing::warn!(app_id = %self.app.id, label, error = %e, "dispatch failed");
                self.say(format!("ERR {label}: {e}")).await;
            }
        }
    }

    async fn settle(&self, d: std::time::Duration) -> bool {
        tokio::time::sleep(d).await;
        !self.session.is_cancelled()
    }

    fn project_dir(&self) -> PathBuf {
        self.launcher.settings.host.project_dir(&self.app.project_path)
    }

    fn dev_command(&self, log_file: &std::path::Path) -> String {
        let dir = self.project_dir().display().to_string();
        let prelude = self
            .launcher
            .settings
            .host
            .prelude
            .as_deref()
            .map(|p| format!("{}; ", p.replace("{project}", &dir)))
            .unwrap_or_default();
        format!(
            "cd {} && {prelude}{} >> {} 2>&1",
            shell_quote(&dir),
            self.app.dev_command,
            shell_quote(&log_file.display().to_string())
        )
    }

    fn proxy_command(&self) -> (String, Option<PathBuf>) {
        let proxy = &self.launcher.settings.proxy;
        let restart = proxy
            .restart_command
            .replace("{project}", &shell_quote(&self.project_dir().display().to_string()));
        match &proxy.dir {
            Some(dir) => (
                format!("cd {} && {restart}", shell_quote(&dir.display().to_string())),
                Some(dir.clone()),
            ),
            None => (restart, None),
        }
    }

    async fn run(self) -> LaunchOutcome {
        let settings = self.launcher.settings.clone();
        let timings = &settings.timings;
        let prober = &self.launcher.prober;
        let port = self.app.port;
        let proxy_port = settings.proxy.port;
        let needs_proxy = self.app.needs_proxy();
        let log_port = self.session.log_port;

        self.enter(LaunchState::SettingUp).await;
        if self.session.is_cancelled() {
            return LaunchOutcome::Cancelled;
        }

        let primary_up = prober.is_reachable_http(port).await;
        if primary_up {
            self.say(format!("Server already running on port {port}")).await;
            if !needs_proxy || prober.is_reachable_http(proxy_port).await {
                return self.ready(true).await;
            }
        } else if prober.is_port_open(port).await {
            return self.fail(LaunchFailure::PortConflict { port }).await;
        }

        let host = &settings.host;
        let log_file = host.log_file(&self.app.id);
        let helper = host.log_helper_path();
        let setup = log_tail::setup_command(&host.log_dir(), &host.state_dir(), &helper, &log_file);
        if let Err(e) = self.launcher.gateway.dispatch(&setup, None).await {
            tracing::warn!(app_id = %self.app.id, error = %e, "log setup dispatch failed");
            self.say(format!("ERR setup: {e}")).await;
        }
        if !self.settle(timings.setup_settle()).await {
            return LaunchOutcome::Cancelled;
        }

        let reader = log_tail::helper_start_command(&helper, &log_file, log_port);
        if let Err(e) = self.launcher.gateway.dispatch(&reader, None).await {
            tracing::warn!(app_id = %self.app.id, error = %e, "log helper dispatch failed");
        }

        // A primary that already answers is only waiting on its proxy.
        if !primary_up {
            self.enter(LaunchState::StartingPrimary).await;
            self.say(format!("CMD: {}", self.app.dev_command)).await;
            self.dispatch("dev", &self.dev_command(&log_file), Some(self.project_dir()))
                .await;
            if !self.settle(timings.primary_settle()).await {
                return LaunchOutcome::Cancelled;
            }
        }

        if needs_proxy {
            self.enter(LaunchState::StartingSecondary).await;
            let (cmd, workdir) = self.proxy_command();
            self.say(format!("CMD: {cmd}")).await;
            self.dispatch("proxy", &cmd, workdir).await;
            if !self.settle(timings.secondary_settle()).await {
                return LaunchOutcome::Cancelled;
            }
        }

        self.enter(LaunchState::WaitingForReadiness).await;
        if needs_proxy {
            self.say(format!("Polling dev:{port} proxy:{proxy_port}")).await;
        } else {
            self.say(format!("Polling dev:{port}")).await;
        }

        let start = Instant::now();
        let mut dev_ready = primary_up;
        let mut proxy_ready = !needs_proxy;
        let mut polls: u32 = 0;
        let mut tail = LogTail::default();
        let fetch_every = timings.log_fetch_every.max(1);
        let status_every = timings.status_every.max(1);

        while !self.session.is_cancelled() && start.elapsed() < timings.readiness_ceiling() {
            if !dev_ready && prober.is_reachable_http(port).await {
                dev_ready = true;
                self.say(format!("+ dev:{port} OK")).await;
            }
            if !proxy_ready && prober.is_reachable_http(proxy_port).await {
                proxy_ready = true;
                self.say(format!("+ proxy:{proxy_port} OK")).await;
            }
            if dev_ready && proxy_ready {
                break;
            }

            polls += 1;
            if polls % fetch_every == 0
                && let Some(fresh) = tail.poll(prober, log_port).await
            {
                for line in log_tail::tail_lines(&fresh, SERVER_LINES_PER_FETCH) {
                    self.log(LogLine::server(line)).await;
                }
            }
            if polls % status_every == 0 {
                let secs = start.elapsed().as_secs();
                let dev = if dev_ready { "OK" } else { "waiting" };
                let mut status = format!("{secs}s dev:{dev}");
                if needs_proxy {
                    status.push_str(if proxy_ready { " proxy:OK" } else { " proxy:waiting" });
                }
                self.say(status).await;
            }
            tokio::time::sleep(timings.poll_interval()).await;
        }

        if self.session.is_cancelled() {
            tracing::debug!(app_id = %self.app.id, "launch cancelled");
            return LaunchOutcome::Cancelled;
        }
        if dev_ready && proxy_ready {
            return self.ready(false).await;
        }

        let output = prober
            .fetch_log(log_port)
            .await
            .map(|c| log_tail::tail_lines(&c, SERVER_LINES_ON_FAILURE))
            .unwrap_or_default();
        let timeout = ReadinessTimeout {
            primary_port: (!dev_ready).then_some(port),
            secondary: (!proxy_ready).then(|| (settings.proxy.name.clone(), proxy_port)),
            output,
            manual_command: format!(
                "cd {} && {}",
                self.project_dir().display(),
                self.app.dev_command
            ),
        };
        self.fail(LaunchFailure::NotReady(timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        gateway::testing::RecordingGateway,
        probe::testing::{Behavior, ScriptedLoopback},
        terminate::{NoProcessTable, Terminator},
    };

    struct Rig {
        gateway: Arc<RecordingGateway>,
        loopback: Arc<ScriptedLoopback>,
        watchdogs: IdleWatchdogs,
        launcher: Launcher,
    }

    fn rig() -> Rig {
        let mut settings = Settings::default();
        settings.host.home = PathBuf::from("/home/u");
        settings.proxy.dir = Some(PathBuf::from("/home/u/projekty/VoicePortal"));
        let settings = Arc::new(settings);

        let gateway = Arc::new(RecordingGateway::default());
        let loopback = Arc::new(ScriptedLoopback::default());
        let prober = HealthProber::new(loopback.clone(), &settings.timings);
        let terminator =
            Terminator::new(gateway.clone(), Arc::new(NoProcessTable), prober.clone(), &settings);
        let watchdogs = IdleWatchdogs::new(prober.clone(), terminator, &settings.timings);
        let launcher = Launcher::new(gateway.clone(), prober, watchdogs.clone(), settings);
        Rig {
            gateway,
            loopback,
            watchdogs,
            launcher,
        }
    }

    fn app(proxy_mode: &str, idle: u32) -> AppSpec {
        serde_json::from_value(serde_json::json!({
            "id": "web", "name": "Web", "projectPath": "projekty/web", "port": 5173,
            "proxyMode": proxy_mode, "idleTimeoutMinutes": idle
        }))
        .unwrap()
    }

    async fn drain(handle: LaunchHandle) -> (Vec<LaunchEvent>, LaunchOutcome, Arc<LaunchSession>) {
        let LaunchHandle {
            session,
            mut events,
            task,
        } = handle;
        let outcome = task.await.unwrap();
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        (out, outcome, session)
    }

    fn non_log(events: &[LaunchEvent]) -> Vec<LaunchEvent> {
        events
            .iter()
            .filter(|e| !matches!(e, LaunchEvent::Log(_)))
            .cloned()
            .collect()
    }

    fn logs(events: &[LaunchEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                LaunchEvent::Log(l) => Some(l.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn primary_ready_after_three_polls() {
        let r = rig();
        // One pre-flight request, then three failed polls.
        r.loopback.up_after(5173, 1 + 3, Behavior::ok("<html>"));

        let started = Instant::now();
        let (events, outcome, session) = drain(r.launcher.launch(app("none", 0))).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, LaunchOutcome::Ready { already_running: false });
        assert_eq!(
            non_log(&events),
            vec![LaunchEvent::StartingPrimary, LaunchEvent::Waiting, LaunchEvent::Ready]
        );
        assert!(elapsed >= Duration::from_millis(8500) && elapsed < Duration::from_secs(9));
        assert_eq!(
            session.history().await,
            vec![
                LaunchState::SettingUp,
                LaunchState::StartingPrimary,
                LaunchState::WaitingForReadiness,
                LaunchState::Ready,
            ]
        );

        let lines = logs(&events);
        assert_eq!(lines[0], "CMD: npm run dev");
        assert_eq!(lines[1], "Intent sent OK");
        assert_eq!(lines[2], "Polling dev:5173");
        assert_eq!(lines[3], "+ dev:5173 OK");

        let cmds = r.gateway.commands();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].starts_with("mkdir -p '/home/u/.devherd/logs' '/home/u/.devherd'"));
        assert_eq!(
            cmds[1],
            "python3 '/home/u/.devherd/logreader.py' '/home/u/.devherd/logs/web.log' 15173"
        );
        assert_eq!(
            cmds[2],
            "cd '/home/u/projekty/web' && npm run dev >> '/home/u/.devherd/logs/web.log' 2>&1"
        );
        assert_eq!(
            r.gateway.workdirs()[2],
            Some(PathBuf::from("/home/u/projekty/web"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_both_targets_with_server_output() {
        let r = rig();
        r.loopback.set(15173, Behavior::ok("Error: EADDRINUSE\n"));

        let (events, outcome, session) = drain(r.launcher.launch(app("default", 0))).await;

        let LaunchOutcome::Failed(LaunchFailure::NotReady(timeout)) = &outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(timeout.primary_port, Some(5173));
        assert_eq!(timeout.output, vec!["Error: EADDRINUSE"]);

        let Some(LaunchEvent::Error { message }) = events.last() else {
            panic!("last event should be the error");
        };
        assert!(message.starts_with("Dev server (port 5173) and proxy (port 3456) not responding."));
        assert!(message.contains("\n\nServer output:\nError: EADDRINUSE\n"));

        assert_eq!(
            non_log(&events[..events.len() - 1]),
            vec![
                LaunchEvent::StartingPrimary,
                LaunchEvent::StartingSecondary,
                LaunchEvent::Waiting
            ]
        );
        let lines = logs(&events);
        assert_eq!(lines.iter().filter(|l| *l == "[srv] Error: EADDRINUSE").count(), 1);
        // Fifth poll, eight seconds into waiting.
        assert!(lines.contains(&"8s dev:waiting proxy:waiting".to_string()));
        assert!(lines.contains(
            &"CMD: cd '/home/u/projekty/VoicePortal' && bash voiceportal-daemon.sh --restart '/home/u/projekty/web'"
                .to_string()
        ));
        assert_eq!(session.state(), LaunchState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_output_suggests_manual_run() {
        let r = rig();
        let (_, outcome, _) = drain(r.launcher.launch(app("none", 0))).await;
        let LaunchOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(
            failure.to_string(),
            "Dev server not responding on port 5173.\n\nNo server output captured.\n\
             Run manually:\n  cd /home/u/projekty/web && npm run dev"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn already_running_skips_start_and_arms_watchdog() {
        let r = rig();
        r.loopback.set(5173, Behavior::ok("up"));

        let (events, outcome, session) = drain(r.launcher.launch(app("none", 5))).await;

        assert_eq!(outcome, LaunchOutcome::Ready { already_running: true });
        assert_eq!(
            events,
            vec![
                LaunchEvent::Log(LogLine::launcher("Server already running on port 5173")),
                LaunchEvent::Ready,
            ]
        );
        assert!(r.gateway.commands().is_empty());
        assert_eq!(
            session.history().await,
            vec![LaunchState::SettingUp, LaunchState::Ready]
        );
        assert!(r.watchdogs.is_active("web").await);
    }

    #[tokio::test(start_paused = true)]
    async fn non_http_listener_is_a_port_conflict() {
        let r = rig();
        r.loopback.set(5173, Behavior::TcpOnly);

        let (events, outcome, _) = drain(r.launcher.launch(app("none", 0))).await;

        assert_eq!(
            outcome,
            LaunchOutcome::Failed(LaunchFailure::PortConflict { port: 5173 })
        );
        let Some(LaunchEvent::Error { message }) = events.last() else {
            panic!("expected error event");
        };
        assert!(message.starts_with("Port 5173 is in use by another process (not HTTP)."));
        assert!(message.ends_with("fuser -k 5173/tcp"));
        assert!(r.gateway.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_silent() {
        let r = rig();
        let handle = r.launcher.launch(app("none", 0));
        handle.session.cancel();
        handle.session.cancel();

        let (events, outcome, session) = drain(handle).await;

        assert_eq!(outcome, LaunchOutcome::Cancelled);
        assert!(!events.iter().any(|e| matches!(e, LaunchEvent::Error { .. })));
        assert!(!session.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_errors_are_logged_and_polling_continues() {
        let mut r = rig();
        let gateway = Arc::new(RecordingGateway::failing(
            crate::gateway::DispatchError::Unreachable("am missing".to_string()),
        ));
        r.launcher.gateway = gateway.clone();
        r.loopback.up_after(5173, 2, Behavior::ok("ok"));

        let (events, outcome, _) = drain(r.launcher.launch(app("none", 0))).await;

        assert_eq!(outcome, LaunchOutcome::Ready { already_running: false });
        let lines = logs(&events);
        assert!(lines.iter().any(|l| l.starts_with("ERR setup: ")));
        assert!(lines.contains(
            &"ERR dev: command gateway unreachable: am missing".to_string()
        ));
        assert_eq!(gateway.commands().len(), 3);
    }
}
