use crate::command::ExitCode;
use crate::interpreter::Interpreter;
use anyhow::{Context, Result, anyhow, bail};
use argh::{EarlyExit, FromArgs};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process, with full access to the interpreter's state.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd".
    const NAME: &'static str;

    /// Return value follows shell conventions: 0 for success, non-zero for error.
    fn execute(self, stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode>;
}

type Handler = fn(&[&str], &mut dyn Write, &mut Interpreter) -> ExitCode;

/// One row of the builtin table.
pub(crate) struct Builtin {
    pub name: &'static str,
    pub description: &'static str,
    pub run: Handler,
}

pub(crate) static BUILTINS: &[Builtin] = &[
    Builtin {
        name: Alias::NAME,
        description: "define or list aliases",
        run: dispatch::<Alias>,
    },
    Builtin {
        name: Cd::NAME,
        description: "change the working directory",
        run: dispatch::<Cd>,
    },
    Builtin {
        name: Exit::NAME,
        description: "exit the shell",
        run: dispatch::<Exit>,
    },
    Builtin {
        name: Export::NAME,
        description: "set or list environment variables",
        run: dispatch::<Export>,
    },
    Builtin {
        name: Help::NAME,
        description: "describe the builtin commands",
        run: dispatch::<Help>,
    },
    Builtin {
        name: History::NAME,
        description: "show command history",
        run: dispatch::<History>,
    },
    Builtin {
        name: Jobs::NAME,
        description: "list jobs",
        run: dispatch::<Jobs>,
    },
    Builtin {
        name: Pwd::NAME,
        description: "print the working directory",
        run: dispatch::<Pwd>,
    },
    Builtin {
        name: Source::NAME,
        description: "run commands from a file",
        run: dispatch::<Source>,
    },
    Builtin {
        name: Unalias::NAME,
        description: "remove aliases",
        run: dispatch::<Unalias>,
    },
];

pub(crate) fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// Parses `args` for `T` and runs it. Errors are reported on stderr as status 1.
fn dispatch<T: BuiltinCommand>(
    args: &[&str],
    stdout: &mut dyn Write,
    shell: &mut Interpreter,
) -> ExitCode {
    let result = match T::from_args(&[T::NAME], args) {
        Ok(cmd) => cmd.execute(stdout, shell),
        Err(EarlyExit { output, status }) => {
            if status.is_ok() {
                let _ = writeln!(stdout, "{}", output.trim_end());
                return 0;
            }
            eprintln!("{}", output.trim_end());
            return 1;
        }
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {:#}", T::NAME, e);
            1
        }
    }
}

fn split_assignment(text: &str) -> Option<(&str, &str)> {
    let (name, value) = text.split_once('=')?;
    let valid = name
        .chars()
        .enumerate()
        .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
    (valid && !name.is_empty()).then_some((name, value))
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    const NAME: &'static str = "pwd";

    fn execute(self, stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        writeln!(stdout, "{}", shell.env().current_dir.to_string_lossy())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    const NAME: &'static str = "cd";

    fn execute(self, _stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        let env = shell.env_mut();
        let target = match &self.target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => env
                .home_dir()
                .ok_or_else(|| anyhow!("no target and HOME not set"))?,
        };

        let new_dir = env.resolve(&target);
        let canonical = fs::canonicalize(&new_dir)
            .with_context(|| format!("can't canonicalize {}", new_dir.display()))?;

        if !canonical.is_dir() {
            bail!("not a directory: {}", canonical.display());
        }
        // Children get the directory through their spawn options; the process cwd stays put.
        let previous = std::mem::replace(&mut env.current_dir, canonical);
        env.set_var("OLDPWD", previous.to_string_lossy());
        let current = env.current_dir.to_string_lossy().into_owned();
        env.set_var("PWD", current);
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Exit the shell.
pub struct Exit {
    #[argh(positional)]
    /// exit status; defaults to the status of the last command.
    pub code: Option<i32>,
}

impl BuiltinCommand for Exit {
    const NAME: &'static str = "exit";

    fn execute(self, _stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        let env = shell.env_mut();
        let code = self.code.unwrap_or(env.last_status);
        env.request_exit(code);
        Ok(code)
    }
}

#[derive(FromArgs)]
/// Set environment variables for commands run by this shell.
/// With no arguments, print every variable.
pub struct Export {
    #[argh(positional, greedy)]
    /// assignments in NAME=VALUE form.
    pub assignments: Vec<String>,
}

impl BuiltinCommand for Export {
    const NAME: &'static str = "export";

    fn execute(self, stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        if self.assignments.is_empty() {
            for (name, value) in shell.env().snapshot() {
                writeln!(stdout, "{name}={value}")?;
            }
            return Ok(0);
        }
        for assignment in &self.assignments {
            let Some((name, value)) = split_assignment(assignment) else {
                bail!("invalid assignment: {}", assignment);
            };
            shell.env_mut().set_var(name, value);
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Define aliases, or print them.
/// With no arguments, print every alias.
pub struct Alias {
    #[argh(positional, greedy)]
    /// definitions in NAME=VALUE form, or a NAME to print.
    pub definitions: Vec<String>,
}

impl BuiltinCommand for Alias {
    const NAME: &'static str = "alias";

    fn execute(self, stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        if self.definitions.is_empty() {
            for (name, value) in shell.aliases().all() {
                writeln!(stdout, "{name}='{value}'")?;
            }
            return Ok(0);
        }
        let mut status = 0;
        for definition in &self.definitions {
            match split_assignment(definition) {
                Some((name, value)) => shell.aliases_mut().set(name, value),
                None => match shell.aliases().get(definition) {
                    Some(value) => writeln!(stdout, "{definition}='{value}'")?,
                    None => {
                        eprintln!("alias: {definition}: not found");
                        status = 1;
                    }
                },
            }
        }
        Ok(status)
    }
}

#[derive(FromArgs)]
/// Remove aliases.
pub struct Unalias {
    #[argh(positional, greedy)]
    /// names of the aliases to remove.
    pub names: Vec<String>,
}

impl BuiltinCommand for Unalias {
    const NAME: &'static str = "unalias";

    fn execute(self, _stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        if self.names.is_empty() {
            bail!("usage: unalias NAME...");
        }
        let mut status = 0;
        for name in &self.names {
            if shell.aliases_mut().remove(name).is_none() {
                eprintln!("unalias: {name}: not found");
                status = 1;
            }
        }
        Ok(status)
    }
}

#[derive(FromArgs)]
/// Show the command history.
pub struct History {
    #[argh(positional)]
    /// number of most recent entries to show.
    pub count: Option<usize>,
}

impl BuiltinCommand for History {
    const NAME: &'static str = "history";

    fn execute(self, stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        let history = shell.history();
        let count = self.count.unwrap_or(history.entries().len());
        for (number, line) in history.last(count) {
            writeln!(stdout, "{number:5}  {line}")?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Describe the builtin commands.
pub struct Help {
    #[argh(positional)]
    /// builtin to describe.
    pub name: Option<String>,
}

impl BuiltinCommand for Help {
    const NAME: &'static str = "help";

    fn execute(self, stdout: &mut dyn Write, _shell: &mut Interpreter) -> Result<ExitCode> {
        match self.name {
            Some(name) => {
                let builtin = lookup(&name).ok_or_else(|| anyhow!("no builtin named {name}"))?;
                writeln!(stdout, "{}: {}", builtin.name, builtin.description)?;
                writeln!(stdout, "Run `{} --help` for usage.", builtin.name)?;
            }
            None => {
                writeln!(stdout, "pipeshell {}", env!("CARGO_PKG_VERSION"))?;
                writeln!(stdout, "Builtin commands:")?;
                for builtin in BUILTINS {
                    writeln!(stdout, "  {:<10}{}", builtin.name, builtin.description)?;
                }
            }
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Run commands from a file in the current shell.
/// Blank lines and lines starting with '#' are skipped; stops at the first failing line.
pub struct Source {
    #[argh(positional)]
    /// file to read.
    pub file: String,
}

impl BuiltinCommand for Source {
    const NAME: &'static str = "source";

    fn execute(self, _stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        let path = shell.env().resolve(self.file.as_ref());
        let content = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        shell.run_source(&content)
    }
}

#[derive(FromArgs)]
/// List the jobs started by this shell.
pub struct Jobs {}

impl BuiltinCommand for Jobs {
    const NAME: &'static str = "jobs";

    fn execute(self, stdout: &mut dyn Write, shell: &mut Interpreter) -> Result<ExitCode> {
        for job in shell.registry().jobs() {
            writeln!(stdout, "[{}]  {:<8}{}", job.id, job.status, job.command_text)?;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::env::Environment;
    use crate::interpreter::ShellContext;
    use crate::registry::Registry;
    use std::env;
    use std::io;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn shell() -> Interpreter {
        Interpreter::new(&Config::ephemeral(), Arc::new(Registry::new()))
            .unwrap()
            .with_env(Environment::empty(env::current_dir().unwrap()))
    }

    fn run(builtin: &str, args: &[&str], shell: &mut Interpreter) -> (ExitCode, String) {
        let mut out = Vec::new();
        let code = (lookup(builtin).unwrap().run)(args, &mut out, shell);
        (code, String::from_utf8(out).unwrap())
    }

    fn make_unique_temp_dir() -> io::Result<PathBuf> {
        let mut p = env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("builtin_test_cd_{}_{}", std::process::id(), nanos));
        fs::create_dir_all(&p)?;
        Ok(p)
    }

    #[test]
    fn test_table_is_sorted_and_unique() {
        let names: Vec<&str> = BUILTINS.iter().map(|b| b.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
        assert!(lookup("cat").is_none());
    }

    #[test]
    fn test_pwd_prints_current_dir() {
        let mut sh = shell();
        let cur = sh.env().current_dir.clone();
        let (code, out) = run("pwd", &[], &mut sh);
        assert_eq!(code, 0);
        assert_eq!(out, format!("{}\n", cur.to_string_lossy()));
    }

    #[test]
    fn test_cd_to_absolute_path() {
        let dir = make_unique_temp_dir().unwrap();
        let canonical = fs::canonicalize(&dir).unwrap();

        let mut sh = shell();
        let original = sh.env().current_dir.clone();
        let target = dir.to_string_lossy().into_owned();
        let (code, _) = run("cd", &[target.as_str()], &mut sh);
        assert_eq!(code, 0);
        assert_eq!(sh.env().current_dir, canonical);
        assert_eq!(sh.env().get_var("PWD"), Some(canonical.to_string_lossy().into_owned()));
        assert_eq!(
            sh.env().get_var("OLDPWD"),
            Some(original.to_string_lossy().into_owned())
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cd_leaves_process_directory_alone() {
        let process_dir = env::current_dir().unwrap();
        let dir = make_unique_temp_dir().unwrap();
        let inner = dir.join("inner");
        fs::create_dir(&inner).unwrap();

        let mut sh = Interpreter::new(&Config::ephemeral(), Arc::new(Registry::new()))
            .unwrap()
            .with_env(Environment::empty(&dir));
        let (code, _) = run("cd", &["inner"], &mut sh);
        assert_eq!(code, 0);
        assert_eq!(sh.env().current_dir, fs::canonicalize(&inner).unwrap());
        assert_eq!(sh.working_dir(), fs::canonicalize(&inner).unwrap());
        assert_eq!(env::current_dir().unwrap(), process_dir);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cd_to_a_file_fails() {
        let dir = make_unique_temp_dir().unwrap();
        fs::write(dir.join("plain"), "x").unwrap();
        let mut sh = Interpreter::new(&Config::ephemeral(), Arc::new(Registry::new()))
            .unwrap()
            .with_env(Environment::empty(&dir));
        let (code, _) = run("cd", &["plain"], &mut sh);
        assert_eq!(code, 1);
        assert_eq!(sh.env().current_dir, dir);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cd_to_home_when_none() {
        let home = make_unique_temp_dir().unwrap();

        let mut sh = shell();
        sh.env_mut().set_var("HOME", home.to_string_lossy());
        let (code, _) = run("cd", &[], &mut sh);
        assert_eq!(code, 0);
        assert_eq!(sh.env().current_dir, fs::canonicalize(&home).unwrap());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn test_cd_missing_dir_fails() {
        let mut sh = shell();
        let before = sh.env().current_dir.clone();
        let (code, _) = run("cd", &["/definitely/not/here"], &mut sh);
        assert_eq!(code, 1);
        assert_eq!(sh.env().current_dir, before);
    }

    #[test]
    fn test_exit_sets_flag_and_code() {
        let mut sh = shell();
        let (code, _) = run("exit", &["3"], &mut sh);
        assert_eq!(code, 3);
        assert!(sh.env().should_exit);
        assert_eq!(sh.env().last_status, 3);
    }

    #[test]
    fn test_export_sets_and_lists() {
        let mut sh = shell();
        let (code, _) = run("export", &["B=2", "A=one=1"], &mut sh);
        assert_eq!(code, 0);
        let (_, out) = run("export", &[], &mut sh);
        assert_eq!(out, "A=one=1\nB=2\n");
        let (code, _) = run("export", &["1BAD=x"], &mut sh);
        assert_eq!(code, 1);
    }

    #[test]
    fn test_alias_and_unalias() {
        let mut sh = shell();
        run("alias", &["ll=ls -l", "g=git"], &mut sh);
        let (_, out) = run("alias", &[], &mut sh);
        assert_eq!(out, "g='git'\nll='ls -l'\n");
        let (code, out) = run("alias", &["ll"], &mut sh);
        assert_eq!((code, out.as_str()), (0, "ll='ls -l'\n"));

        let (code, _) = run("unalias", &["ll", "nope"], &mut sh);
        assert_eq!(code, 1);
        assert!(sh.aliases().get("ll").is_none());
        let (code, _) = run("alias", &["ll"], &mut sh);
        assert_eq!(code, 1);
    }

    #[test]
    fn test_history_format() {
        let mut sh = shell();
        sh.append_history("echo one");
        sh.append_history("echo two");
        sh.append_history("history");
        let (_, out) = run("history", &["2"], &mut sh);
        assert_eq!(out, "    2  echo two\n    3  history\n");
    }

    #[test]
    fn test_help_lists_builtins() {
        let mut sh = shell();
        let (code, out) = run("help", &[], &mut sh);
        assert_eq!(code, 0);
        for builtin in BUILTINS {
            assert!(out.contains(builtin.name));
        }
        let (code, _) = run("help", &["nope"], &mut sh);
        assert_eq!(code, 1);
    }

    #[test]
    fn test_help_flag_prints_usage() {
        let mut sh = shell();
        let (code, out) = run("cd", &["--help"], &mut sh);
        assert_eq!(code, 0);
        assert!(out.contains("Usage: cd"));
        let (code, _) = run("history", &["many"], &mut sh);
        assert_eq!(code, 1);
    }

    #[test]
    fn test_source_runs_lines_and_skips_comments() {
        let dir = make_unique_temp_dir().unwrap();
        let script = dir.join("setup.sh");
        fs::write(&script, "# comment\n\nexport GREETING=hi\nalias hi='echo hi'\n").unwrap();

        let mut sh = shell();
        let path = script.to_string_lossy().into_owned();
        let (code, _) = run("source", &[path.as_str()], &mut sh);
        assert_eq!(code, 0);
        assert_eq!(sh.env().get_var("GREETING"), Some("hi".to_string()));
        assert_eq!(sh.aliases().get("hi"), Some("echo hi"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_jobs_lists_registry_jobs() {
        let mut sh = shell();
        sh.registry()
            .add_job("sleep 10", nix::unistd::Pid::from_raw(4321), true);
        let (_, out) = run("jobs", &[], &mut sh);
        assert_eq!(out, "[1]  Running sleep 10\n");
    }
}
