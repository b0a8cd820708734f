use std::path::{Path, PathBuf};

use anyhow::Context;

/// One row of a process table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    /// Executable name as the kernel reports it (`comm`).
    pub name: String,
    /// Arguments joined by single spaces.
    pub cmdline: String,
    pub has_socket: bool,
}

#[async_trait::async_trait]
pub trait ProcessLister: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<Vec<ProcessInfo>>;
}

/// Used when the engine cannot see the process table of the command host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProcessTable;

#[async_trait::async_trait]
impl ProcessLister for NoProcessTable {
    async fn snapshot(&self) -> anyhow::Result<Vec<ProcessInfo>> {
        anyhow::bail!("process table not visible from this host")
    }
}

#[derive(Debug, Clone)]
pub struct ProcFsLister {
    root: PathBuf,
}

impl Default for ProcFsLister {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcFsLister {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// `(name, ppid)` from a `/proc/<pid>/stat` line.
pub(crate) fn parse_stat(s: &str) -> Option<(String, u32)> {
    let open = s.find('(')?;
    let close = s.rfind(')')?;
    let name = s.get((open + 1)..close)?.to_string();
    let rest = s.get((close + 1)..)?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((name, ppid))
}

pub(crate) fn parse_cmdline(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn holds_socket(dir: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir.join("fd")).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(target) = tokio::fs::read_link(entry.path()).await
            && target.to_string_lossy().starts_with("socket:")
        {
            return true;
        }
    }
    false
}

async fn read_process(dir: &Path, pid: u32) -> Option<ProcessInfo> {
    let stat = tokio::fs::read_to_string(dir.join("stat")).await.ok()?;
    let (name, ppid) = parse_stat(&stat)?;
    let raw = tokio::fs::read(dir.join("cmdline")).await.ok()?;
    let cmdline = parse_cmdline(&raw);
    // Kernel threads have no command line and can never match.
    if cmdline.is_empty() {
        return None;
    }
    Some(ProcessInfo {
        pid,
        ppid,
        name,
        cmdline,
        has_socket: holds_socket(dir).await,
    })
}

#[async_trait::async_trait]
impl ProcessLister for ProcFsLister {
    async fn snapshot(&self) -> anyhow::Result<Vec<ProcessInfo>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("read {}", self.root.display()))?;

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes exit while we scan; a vanished entry is skipped.
            if let Some(info) = read_process(&entry.path(), pid).await {
                out.push(info);
            }
        }
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }
}
