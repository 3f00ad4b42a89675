//! Prompt rendering.
//!
//! Templates use backslash escapes: `\u` user, `\h` short host name, `\w` working
//! directory with the home directory shown as `~`, `\W` its last component, `\t` UTC
//! time as `HH:MM:SS`, `\$` (`#` for root, `$` otherwise) and `\v` the shell version.
//! Unknown escapes are kept as written.

use crate::env::Environment;
use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const RESET: &str = "\x1b[0m";

/// Values substituted into a prompt template.
#[derive(Debug, Clone)]
pub struct PromptInfo {
    pub user: String,
    pub host: String,
    pub cwd: PathBuf,
    pub home: Option<PathBuf>,
    pub is_root: bool,
    pub now: SystemTime,
}

impl PromptInfo {
    /// Collects the values for the current process and `env`.
    pub fn gather(env: &Environment) -> Self {
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            user: env
                .get_var("USER")
                .or_else(|| env.get_var("LOGNAME"))
                .unwrap_or_else(|| "user".to_string()),
            host,
            cwd: env.current_dir.clone(),
            home: env.home_dir(),
            is_root: nix::unistd::geteuid().is_root(),
            now: SystemTime::now(),
        }
    }
}

fn escapes() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\([uhwWt$v])").ok()).as_ref()
}

pub fn render(template: &str, info: &PromptInfo) -> String {
    let Some(re) = escapes() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures| match &caps[1] {
        "u" => info.user.clone(),
        "h" => info.host.split('.').next().unwrap_or_default().to_string(),
        "w" => display_dir(&info.cwd, info.home.as_deref()),
        "W" => base_name(&info.cwd),
        "t" => clock(info.now),
        "$" => (if info.is_root { "#" } else { "$" }).to_string(),
        "v" => env!("CARGO_PKG_VERSION").to_string(),
        other => format!("\\{other}"),
    })
    .into_owned()
}

/// Renders `template`, wrapped in `color` and a reset sequence when one is given.
pub fn render_colored(template: &str, info: &PromptInfo, color: Option<&str>) -> String {
    paint(render(template, info), color)
}

/// Wraps `text` in `color` and a reset sequence. An empty or absent colour leaves it as is.
pub fn paint(text: String, color: Option<&str>) -> String {
    match color {
        Some(color) if !color.is_empty() => format!("{color}{text}{RESET}"),
        _ => text,
    }
}

fn display_dir(cwd: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home {
        if let Ok(rest) = cwd.strip_prefix(home) {
            if rest.as_os_str().is_empty() {
                return "~".to_string();
            }
            return format!("~/{}", rest.display());
        }
    }
    cwd.display().to_string()
}

fn base_name(cwd: &Path) -> String {
    match cwd.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => cwd.display().to_string(),
    }
}

fn clock(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
