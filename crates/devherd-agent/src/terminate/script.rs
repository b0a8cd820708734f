//! Shell text for kills the engine cannot plan in-process.
//!
//! Every literal that a pattern could match (port, paths) is written so the
//! text of the dispatching shell's own command line never contains it.

use std::time::Duration;

use super::strategy::MatchKeys;
use crate::gateway::shell_quote;

/// Pause between `kill -TERM` and `kill -KILL`, in `sleep` syntax.
pub(crate) const KILL_GRACE: &str = "0.5";

/// Escapes the POSIX extended regex metacharacters used by `pkill -f`.
pub(crate) fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '\\' | '.' | '[' | ']' | '(' | ')' | '*' | '+' | '?' | '^' | '$' | '|' | '{' | '}'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `node.*x` becomes `[n]ode.*x`: same matches, but not its own text.
pub(crate) fn bracket_first(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | ' ' | ':' | '=') => {
            format!("[{c}]{}", chars.as_str())
        }
        _ => pattern.to_string(),
    }
}

/// Shell word that expands to `s` while its source text does not contain `s`.
pub(crate) fn split_word(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if !chars.as_str().is_empty() => {
            format!("{}{}", shell_quote(&c.to_string()), shell_quote(chars.as_str()))
        }
        _ => shell_quote(s),
    }
}

fn secs(d: Duration) -> String {
    format!("{}", d.as_secs_f64())
}

fn pkill(pattern: &str) -> String {
    format!("pkill -f {} 2>/dev/null", shell_quote(pattern))
}

fn fuser(port: u16) -> String {
    format!("fuser -k {port}/tcp 2>/dev/null")
}

/// `pkill` patterns for every textual port form.
pub(crate) fn port_patterns(port: u16) -> Vec<String> {
    let b = bracket_first(&port.to_string());
    vec![
        format!(" {b}$"),
        format!(" {b} "),
        format!(":{b}([^0-9]|$)"),
        format!("={b}([^0-9]|$)"),
    ]
}

/// Inputs to the always-run coarse kill.
#[derive(Debug, Clone, Default)]
pub(crate) struct Fallback<'a> {
    pub port: u16,
    pub project: Option<&'a str>,
    /// Log helper file name and port, for a primary with a helper.
    pub log_helper: Option<(&'a str, u16)>,
    /// Fixed proxy name patterns; when set, port and path forms are skipped.
    pub proxy_patterns: Option<&'a [String]>,
}

/// Signal-by-name against the same keys, then kill-by-port.
pub(crate) fn fallback_command(f: &Fallback<'_>) -> String {
    let mut cmds = Vec::new();
    match f.proxy_patterns {
        Some(patterns) => {
            cmds.extend(patterns.iter().map(|p| pkill(&bracket_first(p))));
        }
        None => {
            cmds.extend(port_patterns(f.port).iter().map(|p| pkill(p)));
            if let Some(project) = f.project {
                cmds.push(pkill(&bracket_first(&regex_escape(project))));
            }
        }
    }
    cmds.push(fuser(f.port));
    if let Some((helper, log_port)) = f.log_helper {
        let pattern = format!("{}.*{}", regex_escape(helper), bracket_first(&log_port.to_string()));
        cmds.push(pkill(&bracket_first(&pattern)));
        cmds.push(fuser(log_port));
    }
    cmds.join("; ")
}

const SCRIPT_BODY: &str = r#"self_pid=$$
self_parent=$PPID
killed=' '
order=''
declare -A kids

port_busy() { (exec 3<>"/dev/tcp/127.0.0.1/$port") 2>/dev/null; }

index_tree() {
  kids=()
  local f s pid
  for f in /proc/[0-9]*/stat; do
    read -r s < "$f" 2>/dev/null || continue
    pid=${f#/proc/}; pid=${pid%/stat}
    s=${s##*\)}
    set -- $s
    kids[$2]+="$pid "
  done
}

kill_tree() {
  local pid=$1 c
  [ "$pid" -gt 1 ] 2>/dev/null || return
  case " $self_pid $self_parent " in *" $pid "*) return;; esac
  case "$killed" in *" $pid "*) return;; esac
  killed="$killed$pid "
  for c in ${kids[$pid]}; do kill_tree "$c"; done
  order="$order $pid"
}

match_path() {
  [ -n "$proj" ] || return 1
  case "$2" in *"$proj"*) return 0;; esac
  return 1
}

match_port() {
  case "$2" in *" $port"|*" $port "*) return 0;; esac
  [[ "$2" =~ [:=]$port([^0-9]|$) ]]
}

match_shell() {
  [ -n "$parent_dir" ] || return 1
  local name
  read -r name < "/proc/$1/comm" 2>/dev/null || return 1
  case "$name" in sh|bash|zsh|dash|ash|mksh|ksh) ;; *) return 1;; esac
  case "$2" in *"$parent_dir"*) return 0;; esac
  return 1
}

match_socket() {
  [ -n "$dir_name" ] || return 1
  case "$2" in *"$dir_name"*) ;; *) return 1;; esac
  local fd
  for fd in /proc/$1/fd/*; do
    case "$(readlink "$fd" 2>/dev/null)" in socket:*) return 0;; esac
  done
  return 1
}

run_strategy() {
  local matcher=$1 f pid cmd
  order=''
  for f in /proc/[0-9]*/cmdline; do
    pid=${f#/proc/}; pid=${pid%/cmdline}
    case " $self_pid $self_parent ${kids[$self_pid]} " in *" $pid "*) continue;; esac
    case "$killed" in *" $pid "*) continue;; esac
    cmd=$(tr '\0' ' ' < "$f" 2>/dev/null)
    cmd=${cmd% }
    [ -n "$cmd" ] || continue
    "$matcher" "$pid" "$cmd" && kill_tree "$pid"
  done
  [ -n "$order" ] || return 1
  kill -TERM $order 2>/dev/null
  sleep "$grace"
  kill -KILL $order 2>/dev/null
  return 0
}

for matcher in match_path match_port match_shell match_socket; do
  index_tree
  run_strategy "$matcher" || continue
  sleep "$settle"
  port_busy || break
done
"#;

/// Bash script running the ranked strategies against the remote `/proc`,
/// with a port-free check after each strategy that killed something.
/// `fallback` runs last either way.
pub(crate) fn composite_script(keys: &MatchKeys, settle: Duration, fallback: &str) -> String {
    let opt = |v: &Option<String>| v.as_deref().map(split_word).unwrap_or_else(|| "''".to_string());
    let port = split_word(&keys.port.to_string());
    let mut script = String::new();
    script.push_str(&format!("port={port}\n"));
    script.push_str(&format!("proj={}\n", opt(&keys.project)));
    script.push_str(&format!("parent_dir={}\n", opt(&keys.parent)));
    script.push_str(&format!("dir_name={}\n", opt(&keys.dir_name)));
    script.push_str(&format!("settle={}\n", secs(settle)));
    script.push_str(&format!("grace={KILL_GRACE}\n"));
    script.push_str(SCRIPT_BODY);
    script.push_str(fallback);
    script.push('\n');
    script
}
