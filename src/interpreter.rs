//! The shell proper: alias expansion, connector gating, builtins, job reporting
//! and the interactive loop.

use crate::alias::AliasStore;
use crate::builtin::{self, Builtin};
use crate::cancel::ExecContext;
use crate::command::{Command, ExitCode, Segment, pipeline_text};
use crate::config::Config;
use crate::env::Environment;
use crate::executor::{self, ExecError, Executor, RunningPipeline, SpawnOptions, WaitOutcome};
use crate::history::History;
use crate::lexer::{ParseError, Token, TokenKind, tokenize};
use crate::parser::build_list;
use crate::completion::ShellHelper;
use crate::prompt::{PromptInfo, paint, render_colored};
use crate::registry::{JobStatus, Registry, SignalKind, signal_group};
use crate::terminal::Terminal;
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::signal::Signal;
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use std::ffi::OsString;
use std::fmt::Display;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Parse failures are reported with this status.
pub const PARSE_ERROR_STATUS: ExitCode = 2;

/// The parts of the shell that line preprocessing needs.
pub trait ShellContext {
    fn alias(&self, name: &str) -> Option<String>;
    fn alias_names(&self) -> Vec<String>;
    fn append_history(&mut self, line: &str);
    fn working_dir(&self) -> &Path;
}

/// Replaces aliased words at command position with their definitions.
///
/// An alias whose definition starts with another alias is expanded again, but a name
/// is never expanded inside its own expansion, so `alias ls='ls -F'` terminates.
/// Tokens produced by an expansion carry the offset of the aliased word.
pub fn expand_aliases<C: ShellContext + ?Sized>(
    tokens: Vec<Token>,
    ctx: &C,
) -> Result<Vec<Token>, ParseError> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut command_position = true;
    for token in tokens {
        let next_is_command = token.kind == TokenKind::Pipe || token.kind.is_separator();
        if command_position && token.kind == TokenKind::Word {
            expand_word(token, ctx, &mut Vec::new(), &mut out)?;
        } else {
            out.push(token);
        }
        command_position = next_is_command;
    }
    Ok(out)
}

fn expand_word<C: ShellContext + ?Sized>(
    token: Token,
    ctx: &C,
    seen: &mut Vec<String>,
    out: &mut Vec<Token>,
) -> Result<(), ParseError> {
    let value = match ctx.alias(&token.value) {
        Some(value) if !seen.contains(&token.value) => value,
        _ => {
            out.push(token);
            return Ok(());
        }
    };
    let offset = token.offset;
    let expanded = tokenize(&value).map_err(|e| {
        ParseError::new(format!("in alias {}: {}", token.value, e.message), offset)
    })?;
    seen.push(token.value);

    let mut expanded = expanded.into_iter().map(|t| Token { offset, ..t });
    if let Some(first) = expanded.next() {
        if first.kind == TokenKind::Word {
            expand_word(first, ctx, seen, out)?;
        } else {
            out.push(first);
        }
    }
    out.extend(expanded);
    Ok(())
}

/// A line-oriented shell: parses command lines and runs their pipelines.
///
/// Builtins run in-process; everything else goes through the [`Executor`], which
/// registers each pipeline in the shared [`Registry`].
pub struct Interpreter {
    env: Environment,
    executor: Executor,
    aliases: AliasStore,
    history: History,
    prompt: String,
    prompt_color: Option<String>,
    error_color: Option<String>,
    auto_complete: bool,
    terminal: Option<Terminal>,
    reapers: Vec<JoinHandle<()>>,
}

impl Interpreter {
    /// Creates an interpreter, loading the alias and history files named by `config`.
    pub fn new(config: &Config, registry: Arc<Registry>) -> Result<Self> {
        let mut aliases = match &config.alias_file {
            Some(path) => AliasStore::load(path)?,
            None => AliasStore::in_memory(),
        };
        for (name, value) in &config.aliases {
            if aliases.get(name).is_none() {
                aliases.set(name, value);
            }
        }
        let history = match &config.history_file {
            Some(path) => History::load(path, config.max_history)?,
            None => History::in_memory(config.max_history),
        };
        let executor = Executor::new(registry)
            .with_kill_grace(config.kill_grace())
            .with_poll_interval(config.poll_interval());
        Ok(Self {
            env: Environment::new(),
            executor,
            aliases,
            history,
            prompt: config.prompt.clone(),
            prompt_color: config.prompt_color.clone(),
            error_color: config.error_color.clone(),
            auto_complete: config.auto_complete,
            terminal: None,
            reapers: Vec::new(),
        })
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn aliases(&self) -> &AliasStore {
        &self.aliases
    }

    pub fn aliases_mut(&mut self) -> &mut AliasStore {
        &mut self.aliases
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.executor.registry()
    }

    /// Records `line` in the history, then executes it.
    pub fn run_line(&mut self, line: &str) -> Result<ExitCode> {
        self.append_history(line);
        self.execute_line(line)
    }

    /// Executes every line of a script file. `exit` stops the script.
    pub fn run_script(&mut self, path: &Path) -> Result<ExitCode> {
        let path = self.env.resolve(path);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        self.run_lines(&content, false)
    }

    /// Executes `text` line by line, stopping at the first line that fails.
    pub(crate) fn run_source(&mut self, text: &str) -> Result<ExitCode> {
        self.run_lines(text, true)
    }

    fn run_lines(&mut self, text: &str, stop_on_error: bool) -> Result<ExitCode> {
        let mut status = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            status = self.execute_line(line)?;
            if self.env.should_exit || (stop_on_error && status != 0) {
                break;
            }
        }
        Ok(status)
    }

    /// Parses and runs one line without recording it in the history.
    ///
    /// Parse and execution failures are reported on stderr and turned into a status;
    /// only failures of the shell itself are returned as errors.
    pub fn execute_line(&mut self, line: &str) -> Result<ExitCode> {
        let parsed = {
            let shell: &Self = self;
            tokenize(line)
                .and_then(|tokens| expand_aliases(tokens, shell))
                .and_then(|tokens| build_list(tokens, |name| shell.env.get_var(name)))
        };
        let list = match parsed {
            Ok(list) => list,
            Err(e) => {
                self.print_error(&e);
                self.env.last_status = PARSE_ERROR_STATUS;
                return Ok(PARSE_ERROR_STATUS);
            }
        };

        let mut status = self.env.last_status;
        for segment in list.segments {
            if self.env.should_exit {
                break;
            }
            if !segment.connector.should_run(status) {
                debug!("skipping segment after status {}", status);
                continue;
            }
            status = self.run_segment(segment)?;
            self.env.last_status = status;
        }
        Ok(status)
    }

    fn run_segment(&mut self, segment: Segment) -> Result<ExitCode> {
        let mut commands = segment.commands;
        if commands.len() == 1 && !segment.background {
            if let Some(builtin) = commands[0].program().and_then(builtin::lookup) {
                return self.run_builtin(builtin, &commands[0]);
            }
        }

        let text = pipeline_text(&commands);
        for command in &mut commands {
            self.prepare(command);
        }
        if segment.background {
            Ok(self.run_background(&commands, text))
        } else {
            Ok(self.run_foreground(&commands, text))
        }
    }

    fn run_builtin(&mut self, builtin: &'static Builtin, command: &Command) -> Result<ExitCode> {
        let args: Vec<&str> = command.args[1..].iter().map(String::as_str).collect();
        if let Some(path) = &command.stdin {
            if let Err(e) = executor::open_input(&self.env.resolve(path)) {
                self.print_error(&e);
                return Ok(1);
            }
        }
        match &command.stdout {
            Some(path) => {
                let mut file = match executor::open_output(
                    &self.env.resolve(path),
                    command.append_stdout,
                ) {
                    Ok(file) => file,
                    Err(e) => {
                        self.print_error(&e);
                        return Ok(1);
                    }
                };
                Ok((builtin.run)(&args, &mut file, self))
            }
            None => {
                let mut stdout = io::stdout();
                let code = (builtin.run)(&args, &mut stdout, self);
                stdout.flush()?;
                Ok(code)
            }
        }
    }

    /// Gives an external command this shell's environment and directory.
    fn prepare(&self, command: &mut Command) {
        command.env = Some(self.env.snapshot());
        command.working_dir = Some(self.env.current_dir.clone());
        command.stdin = command.stdin.take().map(|p| self.env.resolve(&p));
        command.stdout = command.stdout.take().map(|p| self.env.resolve(&p));
    }

    fn run_foreground(&mut self, commands: &[Command], text: String) -> ExitCode {
        let options = SpawnOptions {
            foreground: true,
            track_job: true,
            command_text: Some(text.clone()),
        };
        let running = match self.executor.spawn(commands, options) {
            Ok(running) => running,
            Err(e) => return self.report(&e),
        };
        let job = running.job();
        let pgid = running.pgid();
        if let Some(terminal) = &self.terminal {
            terminal.give_to(pgid);
            // A stage that read the terminal before the hand-off was stopped by SIGTTIN.
            let _ = signal_group(pgid, SignalKind::Continue);
        }
        let outcome = running.wait_foreground(&ExecContext::new());
        if let Some(terminal) = &self.terminal {
            terminal.reclaim();
        }

        match outcome {
            Ok(WaitOutcome::Finished(status)) => {
                if let Some(id) = job {
                    self.registry().remove_job(id);
                }
                status.code()
            }
            Ok(WaitOutcome::Stopped(running)) => {
                running.detach();
                if let Some(id) = job {
                    eprintln!();
                    eprintln!("[{id}]+  Stopped  {text}");
                }
                self.spawn_reaper(running);
                128 + Signal::SIGTSTP as i32
            }
            Err(e) => {
                if let Some(id) = job {
                    self.registry().remove_job(id);
                }
                self.report(&e)
            }
        }
    }

    fn run_background(&mut self, commands: &[Command], text: String) -> ExitCode {
        let options = SpawnOptions {
            foreground: false,
            track_job: true,
            command_text: Some(text),
        };
        match self.executor.spawn(commands, options) {
            Ok(running) => {
                if let Some(id) = running.job() {
                    eprintln!("[{id}] {}", running.pgid());
                }
                self.spawn_reaper(running);
                0
            }
            Err(e) => self.report(&e),
        }
    }

    /// Waits for `running` on a dedicated thread; the registry records the outcome.
    fn spawn_reaper(&mut self, running: RunningPipeline) {
        self.reapers.retain(|reaper| !reaper.is_finished());
        let name = format!("reaper-{}", running.pgid());
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let pgid = running.pgid();
            match running.wait(&ExecContext::new()) {
                Ok(status) => debug!("process group {} finished with {}", pgid, status.code()),
                Err(e) => warn!("{}", e),
            }
        });
        match spawned {
            Ok(reaper) => self.reapers.push(reaper),
            Err(e) => warn!("cannot start a reaper thread: {}", e),
        }
    }

    /// Blocks until every background and stopped job has finished.
    pub fn wait_jobs(&mut self) {
        for reaper in self.reapers.drain(..) {
            if reaper.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }

    /// Prints `[id]+  Done  text` for every job that finished since the last call.
    pub fn report_finished_jobs(&self, out: &mut dyn Write) -> io::Result<()> {
        for job in self.registry().take_finished() {
            writeln!(out, "[{}]+  Done  {}", job.id, job.command_text)?;
        }
        Ok(())
    }

    /// Persists aliases and history.
    pub fn save(&self) -> Result<()> {
        self.aliases.save()?;
        self.history.save()
    }

    /// The interactive loop. Returns the status the shell should exit with.
    pub fn repl(&mut self) -> Result<ExitCode> {
        self.terminal = Terminal::acquire();
        let mut rl: Editor<ShellHelper, DefaultHistory> =
            Editor::new().context("failed to create line editor")?;
        if self.auto_complete {
            rl.set_helper(Some(ShellHelper::new()));
        }
        for line in self.history.entries() {
            if let Err(e) = rl.add_history_entry(line.as_str()) {
                warn!("failed to add history entry: {}", e);
            }
        }

        loop {
            self.report_finished_jobs(&mut io::stderr())?;
            if let Some(helper) = rl.helper_mut() {
                let search_path = self.env.get_var("PATH").map(OsString::from);
                helper.refresh(&*self, search_path, &self.history);
            }
            let info = PromptInfo::gather(&self.env);
            let prompt = render_colored(&self.prompt, &info, self.prompt_color.as_deref());
            match rl.readline(&prompt) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = rl.add_history_entry(line.as_str()) {
                        warn!("failed to add history entry: {}", e);
                    }
                    if let Err(e) = self.run_line(&line) {
                        self.print_error(format_args!("{e:#}"));
                    }
                    if self.env.should_exit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    self.print_error(&err);
                    break;
                }
            }
        }

        self.terminate_stopped_jobs();
        if let Err(e) = self.save() {
            self.print_error(format_args!("{e:#}"));
        }
        Ok(self.env.last_status)
    }

    /// `pipeshell: message`, in the configured error colour.
    pub fn error_line(&self, message: impl Display) -> String {
        paint(format!("pipeshell: {message}"), self.error_color.as_deref())
    }

    fn print_error(&self, message: impl Display) {
        eprintln!("{}", self.error_line(message));
    }

    fn report(&self, error: &ExecError) -> ExitCode {
        self.print_error(error);
        error.exit_code()
    }

    /// Stopped jobs would never be resumed once the shell is gone.
    fn terminate_stopped_jobs(&self) {
        let registry = self.registry();
        for job in registry.jobs() {
            if job.status != JobStatus::Stopped {
                continue;
            }
            for kind in [SignalKind::Terminate, SignalKind::Continue] {
                if let Err(e) = registry.signal(job.pgid, kind) {
                    debug!("{}", e);
                }
            }
        }
    }
}

impl ShellContext for Interpreter {
    fn alias(&self, name: &str) -> Option<String> {
        self.aliases.get(name).map(str::to_string)
    }

    fn alias_names(&self) -> Vec<String> {
        self.aliases.all().map(|(name, _)| name.to_string()).collect()
    }

    fn append_history(&mut self, line: &str) {
        self.history.add(line);
    }

    fn working_dir(&self) -> &Path {
        &self.env.current_dir
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct FakeContext {
        aliases: HashMap<&'static str, &'static str>,
        history: Vec<String>,
        dir: PathBuf,
    }

    impl ShellContext for FakeContext {
        fn alias(&self, name: &str) -> Option<String> {
            self.aliases.get(name).map(|v| v.to_string())
        }

        fn alias_names(&self) -> Vec<String> {
            self.aliases.keys().map(|k| k.to_string()).collect()
        }

        fn append_history(&mut self, line: &str) {
            self.history.push(line.to_string());
        }

        fn working_dir(&self) -> &Path {
            &self.dir
        }
    }

    fn context(aliases: &[(&'static str, &'static str)]) -> FakeContext {
        FakeContext {
            aliases: aliases.iter().copied().collect(),
            history: Vec::new(),
            dir: PathBuf::from("/"),
        }
    }

    fn words(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.value.as_str()).collect()
    }

    fn make_unique_temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "interpreter_tests_{}_{}_{}",
            std::process::id(),
            tag,
            nanos
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn shell(dir: &Path) -> Interpreter {
        let mut env = Environment::empty(dir);
        env.set_var("PATH", std::env::var("PATH").unwrap_or_default());
        Interpreter::new(&Config::ephemeral(), Arc::new(Registry::new()))
            .unwrap()
            .with_env(env)
    }

    #[test]
    fn test_aliases_expand_at_command_position_only() {
        let ctx = context(&[("ll", "ls -l")]);
        let tokens = expand_aliases(tokenize("ll ll | ll; echo ll").unwrap(), &ctx).unwrap();
        assert_eq!(
            words(&tokens),
            vec!["ls", "-l", "ll", "|", "ls", "-l", ";", "echo", "ll"]
        );
        assert!(tokens[..2].iter().all(|t| t.offset == 0));
    }

    #[test]
    fn test_self_referencing_alias_terminates() {
        let ctx = context(&[("ls", "ls -F"), ("l", "ls")]);
        let tokens = expand_aliases(tokenize("l").unwrap(), &ctx).unwrap();
        assert_eq!(words(&tokens), vec!["ls", "-F"]);
    }

    #[test]
    fn test_alias_with_operators() {
        let ctx = context(&[("count", "sort | uniq -c")]);
        let tokens = expand_aliases(tokenize("count < words").unwrap(), &ctx).unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::Pipe,
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::RedirectIn,
                TokenKind::Word
            ]
        );
    }

    #[test]
    fn test_broken_alias_reports_its_use() {
        let ctx = context(&[("bad", "echo 'open")]);
        let err = expand_aliases(tokenize("true; bad").unwrap(), &ctx).unwrap_err();
        assert_eq!(err.position, 6);
        assert!(err.message.starts_with("in alias bad"));
    }

    #[test]
    fn test_fake_context_history() {
        let mut ctx = context(&[]);
        ctx.append_history("ls");
        assert_eq!(ctx.history, vec!["ls"]);
        assert_eq!(ctx.working_dir(), Path::new("/"));
    }

    #[test]
    fn test_error_lines_use_the_configured_color() {
        let config = Config {
            error_color: Some("\x1b[31m".to_string()),
            ..Config::ephemeral()
        };
        let colored = Interpreter::new(&config, Arc::new(Registry::new())).unwrap();
        assert_eq!(colored.error_line("boom"), "\x1b[31mpipeshell: boom\x1b[0m");

        let dir = make_unique_temp_dir("plain_errors");
        let plain = shell(&dir);
        let error = ExecError::CommandNotFound {
            program: "nope".to_string(),
        };
        assert_eq!(plain.error_line(&error), "pipeshell: nope: command not found");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_alias_names_are_listed_sorted() {
        let dir = make_unique_temp_dir("alias_names");
        let mut sh = shell(&dir);
        sh.aliases_mut().set("zz", "true");
        sh.aliases_mut().set("aa", "false");
        assert_eq!(sh.alias_names(), vec!["aa", "zz"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_parse_error_status() {
        let dir = make_unique_temp_dir("parse");
        let mut sh = shell(&dir);
        assert_eq!(sh.execute_line("ls | | wc").unwrap(), 2);
        assert_eq!(sh.env().last_status, 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_builtin_output_is_redirected() {
        let dir = make_unique_temp_dir("builtin_redirect");
        let mut sh = shell(&dir);
        sh.execute_line("export COLOR=green").unwrap();
        sh.execute_line("export > vars.txt").unwrap();
        sh.execute_line("pwd >> vars.txt").unwrap();
        let content = fs::read_to_string(dir.join("vars.txt")).unwrap();
        assert!(content.contains("COLOR=green\n"));
        assert!(content.ends_with(&format!("{}\n", dir.display())));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_run_line_records_history() {
        let dir = make_unique_temp_dir("history");
        let mut sh = shell(&dir);
        sh.run_line("export A=1").unwrap();
        sh.execute_line("export B=2").unwrap();
        assert_eq!(sh.history().entries(), ["export A=1"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_exit_stops_remaining_segments() {
        let dir = make_unique_temp_dir("exit");
        let mut sh = shell(&dir);
        let code = sh.execute_line("exit 4; export AFTER=1").unwrap();
        assert_eq!(code, 4);
        assert!(sh.env().should_exit);
        assert_eq!(sh.env().get_var("AFTER"), None);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_source_stops_at_first_failure() {
        let dir = make_unique_temp_dir("source");
        fs::write(
            dir.join("init"),
            "export FIRST=1\nunalias missing\nexport SECOND=1\n",
        )
        .unwrap();
        let mut sh = shell(&dir);
        assert_eq!(sh.execute_line("source init").unwrap(), 1);
        assert_eq!(sh.env().get_var("FIRST"), Some("1".to_string()));
        assert_eq!(sh.env().get_var("SECOND"), None);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_finished_jobs_are_reported_once() {
        let dir = make_unique_temp_dir("jobs");
        let mut sh = shell(&dir);
        sh.execute_line("true &").unwrap();
        sh.wait_jobs();
        let mut out = Vec::new();
        sh.report_finished_jobs(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[1]+  Done  true\n");
        let mut again = Vec::new();
        sh.report_finished_jobs(&mut again).unwrap();
        assert!(again.is_empty());
        let _ = fs::remove_dir_all(dir);
    }
}
