use std::collections::{BTreeMap, BTreeSet};

use super::snapshot::ProcessInfo;

/// Ways of recognising a process we never held a handle to, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
    PathMatch,
    PortInCmdline,
    ShellWrapper,
    SocketHolder,
}

impl Strategy {
    pub const RANKED: [Strategy; 4] = [
        Strategy::PathMatch,
        Strategy::PortInCmdline,
        Strategy::ShellWrapper,
        Strategy::SocketHolder,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Strategy::PathMatch => "path-match",
            Strategy::PortInCmdline => "port-in-cmdline",
            Strategy::ShellWrapper => "shell-wrapper",
            Strategy::SocketHolder => "socket-holder",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

const SHELLS: [&str; 7] = ["sh", "bash", "zsh", "dash", "ash", "mksh", "ksh"];

pub fn is_shell(name: &str) -> bool {
    SHELLS.contains(&name)
}

/// Strings a process command line is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKeys {
    pub port: u16,
    /// Full project directory.
    pub project: Option<String>,
    /// Directory containing the project.
    pub parent: Option<String>,
    /// Last component of the project directory.
    pub dir_name: Option<String>,
}

impl MatchKeys {
    pub fn new(port: u16, project_dir: Option<&std::path::Path>) -> Self {
        let project = project_dir
            .map(|p| p.display().to_string())
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());
        // A parent of "/" would match every absolute path.
        let parent = project_dir
            .and_then(|p| p.parent())
            .map(|p| p.display().to_string())
            .filter(|s| !s.is_empty() && s != "/");
        let dir_name = project_dir
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty());
        Self {
            port,
            project,
            parent,
            dir_name,
        }
    }
}

fn followed_by_boundary(cmdline: &str, needle: &str) -> bool {
    cmdline.match_indices(needle).any(|(i, _)| {
        cmdline[i + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_ascii_digit())
    })
}

/// Port as a trailing arg, a standalone arg, `:port` or `=port`.
pub fn port_in_cmdline(cmdline: &str, port: u16) -> bool {
    let p = port.to_string();
    cmdline.ends_with(&format!(" {p}"))
        || cmdline.contains(&format!(" {p} "))
        || followed_by_boundary(cmdline, &format!(":{p}"))
        || followed_by_boundary(cmdline, &format!("={p}"))
}

fn matches(strategy: Strategy, p: &ProcessInfo, keys: &MatchKeys) -> bool {
    match strategy {
        Strategy::PathMatch => keys
            .project
            .as_deref()
            .is_some_and(|path| p.cmdline.contains(path)),
        Strategy::PortInCmdline => port_in_cmdline(&p.cmdline, keys.port),
        Strategy::ShellWrapper => {
            is_shell(&p.name)
                && keys
                    .parent
                    .as_deref()
                    .is_some_and(|dir| p.cmdline.contains(dir))
        }
        Strategy::SocketHolder => {
            p.has_socket
                && keys
                    .dir_name
                    .as_deref()
                    .is_some_and(|name| p.cmdline.contains(name))
        }
    }
}

/// Process identified by one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCandidate {
    pub pid: u32,
    pub cmdline: String,
    pub reason: Strategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyPlan {
    pub strategy: Strategy,
    pub candidates: Vec<ProcessCandidate>,
    /// Candidates plus their descendants, innermost first.
    pub kill_order: Vec<u32>,
}

fn children_index(snapshot: &[ProcessInfo]) -> BTreeMap<u32, Vec<u32>> {
    let mut kids: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for p in snapshot {
        if p.ppid != p.pid {
            kids.entry(p.ppid).or_default().push(p.pid);
        }
    }
    kids
}

/// Post-order walk from `root`; skipped pids prune their whole subtree.
fn collect_tree(
    root: u32,
    kids: &BTreeMap<u32, Vec<u32>>,
    skip: &BTreeSet<u32>,
    seen: &mut BTreeSet<u32>,
    out: &mut Vec<u32>,
) {
    if root <= 1 || skip.contains(&root) || !seen.insert(root) {
        return;
    }
    if let Some(children) = kids.get(&root) {
        for &c in children {
            collect_tree(c, kids, skip, seen, out);
        }
    }
    out.push(root);
}

/// Ranks every process in `snapshot` by the strategy that would kill it.
///
/// Pids in `exclude` (our own process and its parent) are never targeted,
/// nor is anything below them. A pid claimed by one strategy is not repeated
/// by a later one.
pub fn plan(
    snapshot: &[ProcessInfo],
    keys: &MatchKeys,
    exclude: &BTreeSet<u32>,
) -> Vec<StrategyPlan> {
    let kids = children_index(snapshot);
    let mut claimed: BTreeSet<u32> = BTreeSet::new();
    let mut plans = Vec::new();

    for strategy in Strategy::RANKED {
        let mut candidates = Vec::new();
        let mut kill_order = Vec::new();
        for p in snapshot {
            if p.pid <= 1 || exclude.contains(&p.pid) || claimed.contains(&p.pid) {
                continue;
            }
            if !matches(strategy, p, keys) {
                continue;
            }
            candidates.push(ProcessCandidate {
                pid: p.pid,
                cmdline: p.cmdline.clone(),
                reason: strategy,
            });
            collect_tree(p.pid, &kids, exclude, &mut claimed, &mut kill_order);
        }
        if !candidates.is_empty() {
            plans.push(StrategyPlan {
                strategy,
                candidates,
                kill_order,
            });
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn proc(pid: u32, ppid: u32, name: &str, cmdline: &str, socket: bool) -> ProcessInfo {
        ProcessInfo {
            pid,
            ppid,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            has_socket: socket,
        }
    }

    fn keys() -> MatchKeys {
        MatchKeys::new(5173, Some(Path::new("/home/u/projekty/web")))
    }

    #[test]
    fn keys_derive_parent_and_dir_name() {
        let k = keys();
        assert_eq!(k.project.as_deref(), Some("/home/u/projekty/web"));
        assert_eq!(k.parent.as_deref(), Some("/home/u/projekty"));
        assert_eq!(k.dir_name.as_deref(), Some("web"));

        let top = MatchKeys::new(1, Some(Path::new("/web")));
        assert_eq!(top.parent, None);
        assert_eq!(MatchKeys::new(1, None).project, None);
    }

    #[test]
    fn port_forms_in_cmdline() {
        assert!(port_in_cmdline("python3 -m http.server 5173", 5173));
        assert!(port_in_cmdline("vite --port 5173 --host", 5173));
        assert!(port_in_cmdline("serve -l tcp://localhost:5173", 5173));
        assert!(port_in_cmdline("node app.js --port=5173", 5173));
        assert!(!port_in_cmdline("node app.js --port=51730", 5173));
        assert!(!port_in_cmdline("vite --port 15173", 5173));
        assert!(!port_in_cmdline("node app.js", 5173));
    }

    #[test]
    fn path_match_tree_is_ordered_innermost_first() {
        let snapshot = vec![
            proc(100, 1, "bash", "bash -c cd /home/u/projekty/web && npm run dev", false),
            proc(101, 100, "npm", "npm run dev", false),
            proc(102, 101, "node", "node vite", true),
            proc(103, 102, "esbuild", "esbuild --service", false),
        ];
        let plans = plan(&snapshot, &keys(), &BTreeSet::new());
        assert_eq!(plans[0].strategy, Strategy::PathMatch);
        assert_eq!(plans[0].candidates.len(), 1);
        assert_eq!(plans[0].kill_order, vec![103, 102, 101, 100]);
    }

    #[test]
    fn strategies_are_ranked_and_do_not_repeat_pids() {
        let snapshot = vec![
            proc(10, 1, "node", "node /home/u/projekty/web/node_modules/.bin/vite", true),
            proc(20, 1, "python3", "python3 -m http.server 5173", true),
            proc(30, 1, "bash", "bash /home/u/projekty/other/run.sh", false),
            proc(40, 1, "node", "node web/server.js", true),
            proc(50, 1, "node", "node web/idle.js", false),
        ];
        let plans = plan(&snapshot, &keys(), &BTreeSet::new());
        let order: Vec<(Strategy, Vec<u32>)> = plans
            .iter()
            .map(|p| (p.strategy, p.kill_order.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Strategy::PathMatch, vec![10]),
                (Strategy::PortInCmdline, vec![20]),
                (Strategy::ShellWrapper, vec![30]),
                (Strategy::SocketHolder, vec![40]),
            ]
        );
    }

    #[test]
    fn own_process_and_parent_are_never_targeted() {
        let snapshot = vec![
            proc(500, 1, "devherd", "devherd stop web /home/u/projekty/web", false),
            proc(600, 500, "devherd", "devherd --port 5173", false),
            proc(700, 1, "node", "node /home/u/projekty/web/vite", false),
            proc(701, 700, "sh", "sh -c devherd-child", false),
            proc(702, 701, "devherd", "devherd /home/u/projekty/web", false),
        ];
        let exclude: BTreeSet<u32> = [500, 600, 702].into_iter().collect();
        let plans = plan(&snapshot, &keys(), &exclude);
        let all: Vec<u32> = plans.iter().flat_map(|p| p.kill_order.clone()).collect();
        assert_eq!(all, vec![701, 700]);
    }

    #[test]
    fn without_project_only_port_strategy_applies() {
        let snapshot = vec![
            proc(10, 1, "bash", "bash -c web", true),
            proc(20, 1, "node", "node server.js :3000", true),
        ];
        let plans = plan(&snapshot, &MatchKeys::new(3000, None), &BTreeSet::new());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].strategy, Strategy::PortInCmdline);
        assert_eq!(plans[0].candidates[0].pid, 20);
    }
}
