//! Tab completion and history hints for the interactive prompt.
//!
//! The first word of each pipeline stage completes to builtins, aliases and the
//! executables along `PATH`; any other word completes to a file path. `cd` only
//! offers directories and `git` knows its common subcommands and local branches.

use crate::builtin::BUILTINS;
use crate::external::executables_in_path;
use crate::history::History;
use crate::interpreter::ShellContext;
use log::debug;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};
use std::borrow::Cow;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{self, Stdio};

const GIT_SUBCOMMANDS: &[&str] = &[
    "add", "branch", "checkout", "commit", "diff", "fetch", "log", "merge", "pull", "push",
    "rebase", "status",
];

/// Git subcommands whose next argument is a branch name.
const GIT_BRANCH_COMMANDS: &[&str] = &["branch", "checkout", "merge", "rebase"];

const HINT_STYLE: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// The line-editor helper: completion candidates and history hints.
///
/// The editor owns the helper while a line is read, so [`ShellHelper::refresh`]
/// copies what it needs from the shell before each prompt.
#[derive(Debug)]
pub struct ShellHelper {
    commands: Vec<String>,
    search_path: Option<OsString>,
    working_dir: PathBuf,
    history: History,
}

impl Default for ShellHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellHelper {
    pub fn new() -> Self {
        Self {
            commands: BUILTINS.iter().map(|b| b.name.to_string()).collect(),
            search_path: None,
            working_dir: PathBuf::from("/"),
            history: History::in_memory(0),
        }
    }

    /// Takes in the shell's current aliases, directory, `PATH` and history.
    pub fn refresh<C: ShellContext + ?Sized>(
        &mut self,
        ctx: &C,
        search_path: Option<OsString>,
        history: &History,
    ) {
        let mut commands: Vec<String> = BUILTINS.iter().map(|b| b.name.to_string()).collect();
        commands.extend(ctx.alias_names());
        self.commands = commands;
        self.search_path = search_path;
        self.working_dir = ctx.working_dir().to_path_buf();
        self.history = history.clone();
    }

    /// Candidates for the word ending at `pos`, and the byte offset where that word starts.
    pub fn candidates(&self, line: &str, pos: usize) -> (usize, Vec<Pair>) {
        let before = line.get(..pos).unwrap_or(line);
        let start = word_start(before);
        let word = &before[start..];
        let args: Vec<&str> = current_stage(&before[..start]).split_whitespace().collect();

        let names = match args.as_slice() {
            [] if !word.contains('/') => self.complete_command(word),
            ["cd", ..] => self.complete_path(word, true),
            ["git"] => prefixed(GIT_SUBCOMMANDS.iter().copied(), word),
            ["git", sub] if GIT_BRANCH_COMMANDS.contains(sub) => {
                prefixed(self.git_branches().iter().map(String::as_str), word)
            }
            _ => self.complete_path(word, false),
        };
        let pairs = names
            .into_iter()
            .map(|name| Pair {
                display: name.clone(),
                replacement: name,
            })
            .collect();
        (start, pairs)
    }

    /// The rest of the newest history entry that extends `line`, when the cursor is at the end.
    pub fn hint_for(&self, line: &str, pos: usize) -> Option<String> {
        if pos < line.len() || line.trim().is_empty() {
            return None;
        }
        self.history
            .search(line)
            .into_iter()
            .find(|entry| entry.len() > line.len())
            .map(|entry| entry[line.len()..].to_string())
    }

    fn complete_command(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .commands
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        if let Some(search_path) = &self.search_path {
            names.extend(executables_in_path(search_path, &self.working_dir, prefix));
        }
        names.sort();
        names.dedup();
        names
    }

    /// Entries of the directory named by `word` up to its last `/`, relative to the
    /// working directory. Directories get a trailing `/`.
    fn complete_path(&self, word: &str, dirs_only: bool) -> Vec<String> {
        let (dir_part, file_prefix) = match word.rfind('/') {
            Some(i) => word.split_at(i + 1),
            None => ("", word),
        };
        let search_dir = self.working_dir.join(dir_part);
        let Ok(entries) = fs::read_dir(&search_dir) else {
            return Vec::new();
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let hidden = name.starts_with('.') && !file_prefix.starts_with('.');
            if hidden || !name.starts_with(file_prefix) {
                continue;
            }
            let is_dir = entry.path().is_dir();
            if dirs_only && !is_dir {
                continue;
            }
            let suffix = if is_dir { "/" } else { "" };
            names.push(format!("{dir_part}{name}{suffix}"));
        }
        names.sort();
        names
    }

    fn git_branches(&self) -> Vec<String> {
        let output = process::Command::new("git")
            .args(["branch", "--format=%(refname:short)"])
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                debug!("git branch exited with {}", output.status);
                Vec::new()
            }
            Err(e) => {
                debug!("cannot run git: {}", e);
                Vec::new()
            }
        }
    }
}

fn is_word_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | ';' | '&' | '<' | '>')
}

fn word_start(before: &str) -> usize {
    before
        .char_indices()
        .rev()
        .find(|&(_, c)| is_word_break(c))
        .map_or(0, |(i, c)| i + c.len_utf8())
}

/// The text of the pipeline stage `before` ends in.
fn current_stage(before: &str) -> &str {
    before.rsplit(['|', ';', '&']).next().unwrap_or(before)
}

fn prefixed<'a>(names: impl Iterator<Item = &'a str>, prefix: &str) -> Vec<String> {
    names
        .filter(|name| name.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

impl Completer for ShellHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        Ok(self.candidates(line, pos))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        self.hint_for(line, pos)
    }
}

impl Highlighter for ShellHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Cow::Owned(format!("{HINT_STYLE}{hint}{RESET}"))
    }
}

impl Validator for ShellHelper {}

impl Helper for ShellHelper {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct FakeContext {
        aliases: Vec<String>,
        dir: PathBuf,
    }

    impl ShellContext for FakeContext {
        fn alias(&self, _name: &str) -> Option<String> {
            None
        }

        fn alias_names(&self) -> Vec<String> {
            self.aliases.clone()
        }

        fn append_history(&mut self, _line: &str) {}

        fn working_dir(&self) -> &Path {
            &self.dir
        }
    }

    fn make_unique_temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "completion_tests_{}_{}_{}",
            std::process::id(),
            tag,
            nanos
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// A working directory with `notes.txt`, `nested/` and an executable `bin/pshtool`.
    fn helper(tag: &str, aliases: &[&str]) -> (ShellHelper, PathBuf) {
        let dir = make_unique_temp_dir(tag);
        fs::write(dir.join("notes.txt"), "n").unwrap();
        fs::write(dir.join(".hidden"), "h").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
        fs::create_dir(dir.join("bin")).unwrap();
        let tool = dir.join("bin").join("pshtool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let ctx = FakeContext {
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            dir: dir.clone(),
        };
        let mut history = History::in_memory(10);
        history.add("git status");
        history.add("echo one");
        history.add("git stash");
        let mut helper = ShellHelper::new();
        helper.refresh(&ctx, Some(dir.join("bin").into_os_string()), &history);
        (helper, dir)
    }

    fn replacements(helper: &ShellHelper, line: &str) -> (usize, Vec<String>) {
        let (start, pairs) = helper.candidates(line, line.len());
        (start, pairs.into_iter().map(|p| p.replacement).collect())
    }

    #[test]
    fn test_command_position_offers_builtins_aliases_and_path() {
        let (helper, dir) = helper("commands", &["pshalias", "ll"]);
        assert_eq!(replacements(&helper, "psh"), (0, vec!["pshalias".into(), "pshtool".into()]));
        assert_eq!(replacements(&helper, "his"), (0, vec!["history".into()]));
        assert_eq!(replacements(&helper, "echo hi | psht"), (10, vec!["pshtool".into()]));
        assert_eq!(replacements(&helper, "true &&un").1, vec!["unalias".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_arguments_complete_to_paths() {
        let (helper, dir) = helper("paths", &[]);
        assert_eq!(replacements(&helper, "cat no"), (4, vec!["notes.txt".into()]));
        assert_eq!(replacements(&helper, "cat ne"), (4, vec!["nested/".into()]));
        assert_eq!(replacements(&helper, "wc <bin/p"), (4, vec!["bin/pshtool".into()]));
        assert!(replacements(&helper, "cat .h").1.contains(&".hidden".to_string()));
        assert!(!replacements(&helper, "cat ").1.contains(&".hidden".to_string()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cd_offers_directories_only() {
        let (helper, dir) = helper("cd", &[]);
        assert_eq!(replacements(&helper, "cd ").1, vec!["bin/", "nested/"]);
        assert!(replacements(&helper, "cd no").1.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_git_subcommands() {
        let (helper, dir) = helper("git", &[]);
        assert_eq!(replacements(&helper, "git st").1, vec!["status"]);
        assert_eq!(replacements(&helper, "git re").1, vec!["rebase"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_hint_comes_from_newest_matching_history_entry() {
        let (helper, dir) = helper("hint", &[]);
        assert_eq!(helper.hint_for("git st", 6), Some("ash".to_string()));
        assert_eq!(helper.hint_for("ec", 2), Some("ho one".to_string()));
        assert_eq!(helper.hint_for("git st", 3), None);
        assert_eq!(helper.hint_for("echo one", 8), None);
        assert_eq!(helper.hint_for("  ", 2), None);
        let _ = fs::remove_dir_all(dir);
    }
}
