//! Line history kept across sessions.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Command history, one line per entry, oldest first.
#[derive(Debug, Clone)]
pub struct History {
    path: Option<PathBuf>,
    entries: Vec<String>,
    max: usize,
}

impl History {
    pub fn in_memory(max: usize) -> Self {
        Self {
            path: None,
            entries: Vec::new(),
            max,
        }
    }

    /// Reads `path` if it exists, keeping at most the newest `max` entries.
    pub fn load(path: impl Into<PathBuf>, max: usize) -> Result<Self> {
        let path = path.into();
        let mut history = Self {
            path: None,
            entries: Vec::new(),
            max,
        };
        match fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines() {
                    history.add(line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
        history.path = Some(path);
        Ok(history)
    }

    /// Records `line`, trimmed. Blank lines and repeats of the last entry are skipped.
    pub fn add(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || self.entries.last().is_some_and(|last| last == line) {
            return false;
        }
        self.entries.push(line.to_string());
        if self.entries.len() > self.max {
            let excess = self.entries.len() - self.max;
            self.entries.drain(..excess);
        }
        true
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// The newest `n` entries with their 1-based positions.
    pub fn last(&self, n: usize) -> impl Iterator<Item = (usize, &str)> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..]
            .iter()
            .enumerate()
            .map(move |(i, line)| (start + i + 1, line.as_str()))
    }

    /// Entries starting with `prefix`, newest first.
    pub fn search(&self, prefix: &str) -> Vec<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|line| line.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }

    /// Writes the history file with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        for line in &self.entries {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn test_skips_blanks_and_consecutive_duplicates() {
        let mut history = History::in_memory(10);
        assert!(history.add("ls"));
        assert!(!history.add("  ls  "));
        assert!(!history.add("   "));
        assert!(history.add("pwd"));
        assert!(history.add("ls"));
        assert_eq!(history.entries(), ["ls", "pwd", "ls"]);
    }

    #[test]
    fn test_caps_to_max() {
        let mut history = History::in_memory(3);
        for i in 0..5 {
            history.add(&format!("echo {i}"));
        }
        assert_eq!(history.entries(), ["echo 2", "echo 3", "echo 4"]);
        let numbered: Vec<(usize, &str)> = history.last(2).collect();
        assert_eq!(numbered, vec![(2, "echo 3"), (3, "echo 4")]);
    }

    #[test]
    fn test_search_is_newest_first() {
        let mut history = History::in_memory(10);
        history.add("git status");
        history.add("ls");
        history.add("git log");
        assert_eq!(history.search("git"), vec!["git log", "git status"]);
        assert!(history.search("cargo").is_empty());
    }

    #[test]
    fn test_save_uses_owner_only_mode() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "history_tests_{}_{}",
            std::process::id(),
            nanos
        ));
        let mut history = History::load(&path, 100).unwrap();
        history.add("echo one");
        history.add("echo two");
        history.save().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let reloaded = History::load(&path, 100).unwrap();
        assert_eq!(reloaded.entries(), ["echo one", "echo two"]);
        let _ = fs::remove_file(path);
    }
}
