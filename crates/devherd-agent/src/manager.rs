use std::{collections::HashMap, sync::Arc};

use devherd_model::AppSpec;
use tokio::sync::Mutex;

use crate::{
    gateway::CommandGateway,
    launcher::{LaunchHandle, LaunchSession, Launcher},
    probe::{HealthProber, LoopbackClient},
    settings::Settings,
    terminate::{AppTermination, ProcessLister, Terminator},
    watchdog::IdleWatchdogs,
};

/// Holds at most one live launch per app id.
#[derive(Clone)]
pub struct AppManager {
    sessions: Arc<Mutex<HashMap<String, Arc<LaunchSession>>>>,
    launcher: Launcher,
    watchdogs: IdleWatchdogs,
    terminator: Terminator,
    prober: HealthProber,
}

impl AppManager {
    pub fn new(
        settings: Arc<Settings>,
        gateway: Arc<dyn CommandGateway>,
        lister: Arc<dyn ProcessLister>,
        loopback: Arc<dyn LoopbackClient>,
    ) -> Self {
        let prober = HealthProber::new(loopback, &settings.timings);
        let terminator = Terminator::new(gateway.clone(), lister, prober.clone(), &settings);
        let watchdogs = IdleWatchdogs::new(prober.clone(), terminator.clone(), &settings.timings);
        let launcher = Launcher::new(gateway, prober.clone(), watchdogs.clone(), settings);
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            launcher,
            watchdogs,
            terminator,
            prober,
        }
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    pub fn watchdogs(&self) -> &IdleWatchdogs {
        &self.watchdogs
    }

    /// Cancels any prior session and watchdog for the id, then starts fresh.
    /// Retrying a failed launch is just another call.
    pub async fn launch(&self, app: AppSpec) -> LaunchHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(prev) = sessions.remove(&app.id) {
            tracing::info!(app_id = %app.id, launch_id = %prev.id.0, "superseding previous launch");
            prev.cancel();
        }
        self.watchdogs.cancel(&app.id).await;

        let handle = self.launcher.launch(app);
        tracing::info!(
            app_id = %handle.session.app_id,
            launch_id = %handle.session.id.0,
            "launch started"
        );
        sessions.insert(handle.session.app_id.clone(), handle.session.clone());
        handle
    }

    pub async fn session(&self, app_id: &str) -> Option<Arc<LaunchSession>> {
        self.sessions.lock().await.get(app_id).cloned()
    }

    /// Abandons the launch and its watchdog; processes are left alone.
    pub async fn cancel(&self, app_id: &str) -> bool {
        let prev = self.sessions.lock().await.remove(app_id);
        let had_watchdog = self.watchdogs.cancel(app_id).await;
        match prev {
            Some(session) => {
                session.cancel();
                true
            }
            None => had_watchdog,
        }
    }

    pub async fn stop(&self, app: &AppSpec) -> AppTermination {
        self.cancel(&app.id).await;
        self.terminator.terminate_app(app).await
    }

    pub async fn shutdown(&self) {
        for (_, session) in self.sessions.lock().await.drain() {
            session.cancel();
        }
        self.watchdogs.cancel_all().await;
    }
}
