//! Heuristic termination of processes we never held a handle to.
//!
//! A matched process is not known to be the one we started; false-positive
//! kills of an unrelated process sharing the port text are accepted.

pub mod script;
pub mod snapshot;
pub mod strategy;

use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use devherd_model::AppSpec;

pub use snapshot::{NoProcessTable, ProcFsLister, ProcessInfo, ProcessLister};
pub use strategy::{MatchKeys, ProcessCandidate, Strategy, StrategyPlan, plan};

use crate::{
    gateway::{CommandGateway, DispatchError},
    probe::HealthProber,
    settings::{HostSettings, ProxySettings, Settings},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Primary,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationTarget {
    pub port: u16,
    pub project_dir: Option<PathBuf>,
    pub role: ProcessRole,
    /// Log helper to stop alongside a primary.
    pub log_port: Option<u16>,
}

impl TerminationTarget {
    pub fn primary(port: u16, project_dir: Option<PathBuf>) -> Self {
        Self {
            port,
            project_dir,
            role: ProcessRole::Primary,
            log_port: None,
        }
    }

    pub fn proxy(port: u16) -> Self {
        Self {
            port,
            project_dir: None,
            role: ProcessRole::Proxy,
            log_port: None,
        }
    }

    pub fn with_log_port(mut self, log_port: u16) -> Self {
        self.log_port = Some(log_port);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub pids: Vec<u32>,
    pub port_free_after: bool,
}

/// What was attempted. Success is only ever observed, never confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    pub attempts: Vec<StrategyAttempt>,
    /// Strategies were shipped as one remote script instead of planned here.
    pub composite_script: bool,
    pub port_freed: bool,
    pub dispatch_errors: Vec<DispatchError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppTermination {
    pub primary: TerminationReport,
    pub proxy: Option<TerminationReport>,
}

/// Pids that must never be targeted: ourselves and our parent.
pub fn self_pids() -> BTreeSet<u32> {
    let mut pids = BTreeSet::from([std::process::id()]);
    #[cfg(unix)]
    {
        let ppid = unsafe { libc::getppid() };
        if ppid > 0 {
            pids.insert(ppid as u32);
        }
    }
    pids
}

#[derive(Clone)]
pub struct Terminator {
    gateway: Arc<dyn CommandGateway>,
    lister: Arc<dyn ProcessLister>,
    prober: HealthProber,
    kill_settle: Duration,
    host: HostSettings,
    proxy: ProxySettings,
    exclude: BTreeSet<u32>,
}

impl Terminator {
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        lister: Arc<dyn ProcessLister>,
        prober: HealthProber,
        settings: &Settings,
    ) -> Self {
        Self {
            gateway,
            lister,
            prober,
            kill_settle: settings.timings.kill_settle(),
            host: settings.host.clone(),
            proxy: settings.proxy.clone(),
            exclude: self_pids(),
        }
    }

    #[cfg(test)]
    fn with_exclude(mut self, exclude: BTreeSet<u32>) -> Self {
        self.exclude = exclude;
        self
    }

    async fn send(&self, command: &str, report: &mut TerminationReport) {
        if let Err(e) = self.gateway.dispatch(command, None).await {
            tracing::warn!(error = %e, "kill dispatch failed");
            report.dispatch_errors.push(e);
        }
    }

    async fn port_free(&self, port: u16) -> bool {
        tokio::time::sleep(self.kill_settle).await;
        !self.prober.is_port_open(port).await
    }

    async fn run_plans(&self, plans: &[StrategyPlan], port: u16, report: &mut TerminationReport) {
        for p in plans {
            let pids = p
                .kill_order
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(port, strategy = %p.strategy, pids = %pids, "killing process tree");
            let cmd = format!(
                "kill -TERM {pids} 2>/dev/null; sleep {}; kill -KILL {pids} 2>/dev/null",
                script::KILL_GRACE
            );
            self.send(&cmd, report).await;

            let free = self.port_free(port).await;
            report.attempts.push(StrategyAttempt {
                strategy: p.strategy,
                pids: p.kill_order.clone(),
                port_free_after: free,
            });
            if free {
                report.port_freed = true;
                return;
            }
        }
    }

    fn fallback(&self, target: &TerminationTarget, project: Option<&str>) -> String {
        let helper_name = self
            .host
            .log_helper_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "logreader.py".to_string());
        let log_helper = target.log_port.map(|p| (helper_name, p));
        script::fallback_command(&script::Fallback {
            port: target.port,
            project,
            log_helper: log_helper.as_ref().map(|(h, p)| (h.as_str(), *p)),
            proxy_patterns: (target.role == ProcessRole::Proxy)
                .then_some(self.proxy.process_patterns.as_slice()),
        })
    }

    /// Best effort; only dispatch failures come back, inside the report.
    pub async fn terminate(&self, target: &TerminationTarget) -> TerminationReport {
        let mut report = TerminationReport::default();
        let project = target.project_dir.as_ref().map(|p| p.display().to_string());
        let fallback = self.fallback(target, project.as_deref());

        if target.role == ProcessRole::Proxy {
            tracing::info!(port = target.port, "stopping proxy by name");
            self.send(&fallback, &mut report).await;
        } else {
            let keys = MatchKeys::new(target.port, target.project_dir.as_deref());
            match self.lister.snapshot().await {
                Ok(snapshot) => {
                    let plans = plan(&snapshot, &keys, &self.exclude);
                    tracing::debug!(port = target.port, strategies = plans.len(), "termination planned");
                    self.run_plans(&plans, target.port, &mut report).await;
                    self.send(&fallback, &mut report).await;
                }
                Err(e) => {
                    tracing::debug!(port = target.port, error = %e, "no process snapshot, using remote script");
                    report.composite_script = true;
                    let script = script::composite_script(&keys, self.kill_settle, &fallback);
                    self.send(&script, &mut report).await;
                }
            }
        }

        if !report.port_freed {
            report.port_freed = self.port_free(target.port).await;
        }
        tracing::info!(
            port = target.port,
            freed = report.port_freed,
            attempts = report.attempts.len(),
            "termination attempted"
        );
        report
    }

    /// Stops the primary with its log helper, then the proxy if the app uses one.
    pub async fn terminate_app(&self, app: &AppSpec) -> AppTermination {
        let target = TerminationTarget::primary(
            app.port,
            Some(self.host.project_dir(&app.project_path)),
        )
        .with_log_port(app.log_port());
        let primary = self.terminate(&target).await;
        let proxy = if app.needs_proxy() {
            Some(self.terminate(&TerminationTarget::proxy(self.proxy.port)).await)
        } else {
            None
        };
        AppTermination { primary, proxy }
    }
}
