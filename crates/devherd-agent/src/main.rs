use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use devherd_agent::{
    fleet::FleetMonitor,
    gateway::{CommandGateway, ShellGateway, TermuxGateway},
    launcher::LaunchOutcome,
    manager::AppManager,
    model::{LaunchEvent, ServerEntry},
    probe::ReqwestLoopback,
    settings::{GatewayKind, Settings, SnapshotMode, format_error_chain},
    terminate::{NoProcessTable, ProcFsLister, ProcessLister, TerminationReport, TerminationTarget},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// devherd - dev server launcher and watchdog
#[derive(Parser, Debug)]
#[command(name = "devherd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: $DEVHERD_CONFIG or ~/.devherd/devherd.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured apps
    #[command(alias = "ls")]
    Apps,

    /// Launch an app and follow it until ready; stays up for the idle watchdog
    Launch {
        /// App id
        id: String,
    },

    /// Stop an app and its proxy
    Stop {
        /// App id
        id: String,
    },

    /// Kill whatever holds a port
    KillPort {
        port: u16,
        /// Project directory to match command lines against
        #[arg(long)]
        path: Option<PathBuf>,
        /// Treat the port as the proxy
        #[arg(long)]
        proxy: bool,
    },

    /// Poll configured and well-known ports
    Monitor {
        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match std::env::var_os("DEVHERD_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(PathBuf::from(dir), "devherd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .try_init();
            None
        }
    }
}

fn gateway(settings: &Settings) -> Arc<dyn CommandGateway> {
    match settings.host.gateway {
        GatewayKind::Shell => Arc::new(ShellGateway::new(settings.host.shell.clone())),
        GatewayKind::Termux => Arc::new(TermuxGateway::default()),
    }
}

fn lister(settings: &Settings) -> Arc<dyn ProcessLister> {
    match settings.termination.snapshot {
        SnapshotMode::Procfs => Arc::new(ProcFsLister::default()),
        SnapshotMode::Remote => Arc::new(NoProcessTable),
    }
}

fn print_event(event: &LaunchEvent, port: u16) {
    match event {
        LaunchEvent::StartingPrimary => println!("Starting dev server..."),
        LaunchEvent::StartingSecondary => println!("Starting proxy..."),
        LaunchEvent::Waiting => println!("Waiting for servers..."),
        LaunchEvent::Ready => println!("Ready: http://127.0.0.1:{port}/"),
        LaunchEvent::Error { message } => eprintln!("{message}"),
        LaunchEvent::Log(line) => println!("  {line}"),
    }
}

fn print_report(label: &str, report: &TerminationReport) {
    for a in &report.attempts {
        println!(
            "{label}: {} killed {:?}{}",
            a.strategy,
            a.pids,
            if a.port_free_after { " (port free)" } else { "" }
        );
    }
    for e in &report.dispatch_errors {
        eprintln!("{label}: {e}");
    }
    let state = if report.port_freed {
        "port free"
    } else {
        "port still in use"
    };
    println!("{label}: {state}");
}

fn print_entries(entries: &[ServerEntry]) {
    for e in entries.iter().filter(|e| e.is_visible()) {
        let state = if e.running { "UP" } else { "DOWN" };
        println!("{:<24} {:>5}  {:<4}  {}", e.name, e.port, state, e.detail);
    }
}

async fn launch(manager: &AppManager, settings: &Settings, id: &str) -> anyhow::Result<()> {
    let app = settings
        .app(id)
        .with_context(|| format!("unknown app id: {id}"))?
        .clone();
    let port = app.port;
    let idle = app.idle_timeout_minutes;
    let mut handle = manager.launch(app).await;

    loop {
        tokio::select! {
            ev = handle.events.recv() => match ev {
                Some(ev) => print_event(&ev, port),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                manager.cancel(id).await;
            }
        }
    }

    match handle.task.await.context("launch worker")? {
        LaunchOutcome::Ready { .. } if idle > 0 => {
            println!("Idle watchdog armed ({idle} min). Ctrl-C to exit.");
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            manager.shutdown().await;
            Ok(())
        }
        LaunchOutcome::Ready { .. } => Ok(()),
        LaunchOutcome::Failed(_) => anyhow::bail!("launch of {id} failed"),
        LaunchOutcome::Cancelled => {
            println!("Cancelled.");
            Ok(())
        }
    }
}

async fn monitor(manager: &AppManager, settings: &Settings, once: bool) -> anyhow::Result<()> {
    let (fleet, mut events) = FleetMonitor::new(
        &settings.apps,
        settings,
        manager.prober().clone(),
        manager.terminator().clone(),
    );
    if once {
        print_entries(&fleet.poll_once().await);
        return Ok(());
    }

    let mut snapshot = fleet.snapshot();
    let poller = fleet.clone().spawn();
    loop {
        tokio::select! {
            Some(ev) = events.recv() => println!("{ev}"),
            changed = snapshot.changed() => {
                if changed.is_err() {
                    break;
                }
                let entries = snapshot.borrow_and_update().clone();
                println!("--");
                print_entries(&entries);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    poller.abort();
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let path = cli.config.unwrap_or_else(Settings::default_path);
    let settings = Arc::new(Settings::load(&path)?);
    let loopback = ReqwestLoopback::new(settings.timings.tcp_timeout())?;
    let manager = AppManager::new(
        settings.clone(),
        gateway(&settings),
        lister(&settings),
        Arc::new(loopback),
    );

    match cli.command {
        Commands::Apps => {
            for app in &settings.apps {
                let proxy = if app.needs_proxy() { " +proxy" } else { "" };
                println!("{:<16} {:>5}  {}{proxy}", app.id, app.port, app.name);
            }
            Ok(())
        }
        Commands::Launch { id } => launch(&manager, &settings, &id).await,
        Commands::Stop { id } => {
            let app = settings
                .app(&id)
                .with_context(|| format!("unknown app id: {id}"))?;
            let out = manager.stop(app).await;
            print_report(&format!("{id}:{}", app.port), &out.primary);
            if let Some(proxy) = &out.proxy {
                print_report(&format!("proxy:{}", settings.proxy.port), proxy);
            }
            Ok(())
        }
        Commands::KillPort { port, path, proxy } => {
            let target = if proxy {
                TerminationTarget::proxy(port)
            } else {
                let dir = path.map(|p| settings.host.project_dir(&p.to_string_lossy()));
                TerminationTarget::primary(port, dir)
            };
            let report = manager.terminator().terminate(&target).await;
            print_report(&port.to_string(), &report);
            Ok(())
        }
        Commands::Monitor { once } => monitor(&manager, &settings, once).await,
    }
}

#[tokio::main]
async fn main() {
    let _guard = init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("devherd: {}", format_error_chain(&e));
        std::process::exit(1);
    }
}
