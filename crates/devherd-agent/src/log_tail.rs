use std::path::Path;

use base64::Engine;

use crate::gateway::shell_quote;
use crate::probe::HealthProber;

/// Window the helper serves from the end of the log file.
pub const HELPER_WINDOW_BYTES: usize = 8192;

/// Serves the trailing window of `argv[1]` on `127.0.0.1:argv[2]` for any GET.
const HELPER_SCRIPT: &str = r#"import http.server,sys
class H(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        try:
            f=open(sys.argv[1])
            d=f.read()[-8192:]
            f.close()
        except: d=''
        self.send_response(200)
        self.end_headers()
        self.wfile.write(d.encode())
    def log_message(self,*a):pass
http.server.HTTPServer(('127.0.0.1',int(sys.argv[2])),H).serve_forever()
"#;

/// Creates the state dirs, installs the helper and truncates the log.
pub fn setup_command(log_dir: &Path, state_dir: &Path, helper: &Path, log_file: &Path) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(HELPER_SCRIPT.as_bytes());
    format!(
        "mkdir -p {} {} && echo '{}' | base64 -d > {} && : > {}",
        shell_quote(&log_dir.display().to_string()),
        shell_quote(&state_dir.display().to_string()),
        b64,
        shell_quote(&helper.display().to_string()),
        shell_quote(&log_file.display().to_string()),
    )
}

pub fn helper_start_command(helper: &Path, log_file: &Path, log_port: u16) -> String {
    format!(
        "python3 {} {} {}",
        shell_quote(&helper.display().to_string()),
        shell_quote(&log_file.display().to_string()),
        log_port
    )
}

/// Part of `next` not already seen in `prev`.
///
/// A non-extension (rotation, truncation) makes all of `next` new.
pub fn new_content<'a>(prev: &str, next: &'a str) -> &'a str {
    if !prev.is_empty()
        && let Some(rest) = next.strip_prefix(prev)
    {
        return rest;
    }
    next
}

/// Last `n` lines of `chunk`, ignoring surrounding blank space.
pub fn tail_lines(chunk: &str, n: usize) -> Vec<String> {
    let trimmed = chunk.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = trimmed.split('\n').collect();
    let from = lines.len().saturating_sub(n);
    lines[from..].iter().map(|l| l.trim_end_matches('\r').to_string()).collect()
}

/// Incremental reader over one log helper. Owned by a single launch worker.
#[derive(Debug, Default)]
pub struct LogTail {
    last_seen: String,
}

impl LogTail {
    /// Records `content` and returns what is new since the previous call.
    pub fn absorb(&mut self, content: &str) -> Option<String> {
        if content.is_empty() || content == self.last_seen {
            return None;
        }
        let fresh = new_content(&self.last_seen, content).to_string();
        self.last_seen = content.to_string();
        Some(fresh)
    }

    /// Fetches and diffs; an unreachable helper yields nothing.
    pub async fn poll(&mut self, prober: &HealthProber, log_port: u16) -> Option<String> {
        let content = prober.fetch_log(log_port).await?;
        self.absorb(&content)
    }
}
