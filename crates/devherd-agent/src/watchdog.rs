use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use devherd_model::AppSpec;
use tokio::{
    sync::{Mutex, oneshot},
    task::JoinHandle,
    time::Instant,
};

use crate::{probe::HealthProber, settings::Timings, terminate::Terminator};

struct WatchdogHandle {
    generation: u64,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// At most one idle timer per app id; a new one replaces the old.
#[derive(Clone)]
pub struct IdleWatchdogs {
    active: Arc<Mutex<HashMap<String, WatchdogHandle>>>,
    generation: Arc<AtomicU64>,
    prober: HealthProber,
    terminator: Terminator,
    tick: Duration,
}

impl IdleWatchdogs {
    pub fn new(prober: HealthProber, terminator: Terminator, timings: &Timings) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            prober,
            terminator,
            tick: timings.watchdog_tick(),
        }
    }

    /// Arms the watchdog for `app`. Returns false when its timeout is disabled.
    pub async fn start(&self, app: &AppSpec) -> bool {
        if app.idle_timeout_minutes == 0 {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(self.clone().watch(app.clone(), generation, cancelled));

        let mut active = self.active.lock().await;
        if let Some(prev) = active.insert(
            app.id.clone(),
            WatchdogHandle {
                generation,
                cancel,
                task,
            },
        ) {
            tracing::debug!(app_id = %app.id, "replacing idle watchdog");
            let _ = prev.cancel.send(());
        }
        tracing::info!(
            app_id = %app.id,
            timeout_minutes = app.idle_timeout_minutes,
            "idle watchdog armed"
        );
        true
    }

    pub async fn cancel(&self, app_id: &str) -> bool {
        let Some(prev) = self.active.lock().await.remove(app_id) else {
            return false;
        };
        let _ = prev.cancel.send(());
        tracing::debug!(app_id, "idle watchdog cancelled");
        true
    }

    pub async fn is_active(&self, app_id: &str) -> bool {
        self.active
            .lock()
            .await
            .get(app_id)
            .is_some_and(|h| !h.task.is_finished())
    }

    pub async fn cancel_all(&self) {
        for (_, h) in self.active.lock().await.drain() {
            let _ = h.cancel.send(());
        }
    }

    async fn watch(self, app: AppSpec, generation: u64, mut cancelled: oneshot::Receiver<()>) {
        let timeout = Duration::from_secs(u64::from(app.idle_timeout_minutes) * 60);
        let mut last_activity = Instant::now();
        loop {
            // A dropped sender counts as cancellation too.
            tokio::select! {
                _ = &mut cancelled => return,
                _ = tokio::time::sleep(self.tick) => {}
            }
            if self.prober.is_reachable_http(app.port).await {
                last_activity = Instant::now();
                continue;
            }
            let idle = last_activity.elapsed();
            if idle < timeout {
                continue;
            }

            tracing::info!(
                app_id = %app.id,
                port = app.port,
                idle_secs = idle.as_secs(),
                "idle timeout reached, stopping app"
            );
            self.terminator.terminate_app(&app).await;

            let mut active = self.active.lock().await;
            if active.get(&app.id).is_some_and(|h| h.generation == generation) {
                active.remove(&app.id);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        gateway::testing::RecordingGateway,
        probe::testing::{Behavior, ScriptedLoopback},
        settings::Settings,
        terminate::NoProcessTable,
    };

    fn rig() -> (IdleWatchdogs, Arc<RecordingGateway>, Arc<ScriptedLoopback>) {
        let mut settings = Settings::default();
        settings.host.home = PathBuf::from("/home/u");
        let gateway = Arc::new(RecordingGateway::default());
        let loopback = Arc::new(ScriptedLoopback::default());
        let prober = HealthProber::new(loopback.clone(), &settings.timings);
        let terminator =
            Terminator::new(gateway.clone(), Arc::new(NoProcessTable), prober.clone(), &settings);
        (
            IdleWatchdogs::new(prober, terminator, &settings.timings),
            gateway,
            loopback,
        )
    }

    fn app(idle: u32) -> AppSpec {
        serde_json::from_value(serde_json::json!({
            "id": "web", "name": "Web", "projectPath": "projekty/web", "port": 5173,
            "idleTimeoutMinutes": idle
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_port_is_stopped_after_timeout_not_before() {
        let (w, gateway, _loopback) = rig();
        assert!(w.start(&app(1)).await);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(gateway.commands().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let cmds = gateway.commands();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].starts_with("port='5''173'\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_the_app_alive() {
        let (w, gateway, loopback) = rig();
        loopback.set(5173, Behavior::ok("busy"));
        w.start(&app(1)).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(gateway.commands().is_empty());
        assert!(w.is_active("web").await);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_and_cancel_interrupts_sleep() {
        let (w, gateway, _loopback) = rig();
        w.start(&app(1)).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        // Relaunch: countdown restarts from here.
        w.start(&app(1)).await;

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(gateway.commands().is_empty());

        assert!(w.cancel("web").await);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(gateway.commands().is_empty());
        assert!(!w.is_active("web").await);
    }

    #[tokio::test]
    async fn zero_timeout_is_disabled() {
        let (w, _, _) = rig();
        assert!(!w.start(&app(0)).await);
        assert!(!w.is_active("web").await);
    }
}
