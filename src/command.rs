use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// One stage of a pipeline: a program, its arguments and its redirections.
///
/// `args[0]` is the executable. A command is only admitted to a pipeline once it has
/// at least one argument. `append_stdout` is meaningful only when `stdout` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<String>,
    /// File to read standard input from (first stage only).
    pub stdin: Option<PathBuf>,
    /// File to write standard output to (last stage only).
    pub stdout: Option<PathBuf>,
    pub append_stdout: bool,
    pub background: bool,
    /// Full replacement environment. `None` inherits the caller's environment.
    pub env: Option<Vec<(String, String)>>,
    pub working_dir: Option<PathBuf>,
}

impl Command {
    /// Convenience constructor for a command without redirections.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Human-readable rendering used for job listings.
    pub fn display_text(&self) -> String {
        let mut text = self.args.join(" ");
        if let Some(path) = &self.stdin {
            text.push_str(&format!(" < {}", path.display()));
        }
        if let Some(path) = &self.stdout {
            let op = if self.append_stdout { ">>" } else { ">" };
            text.push_str(&format!(" {} {}", op, path.display()));
        }
        text
    }
}

/// Renders a pipeline the way a user would have typed it.
pub fn pipeline_text(commands: &[Command]) -> String {
    commands
        .iter()
        .map(Command::display_text)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// How a segment is gated on the status of the segment before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// First segment, or after `;` / `&`.
    Always,
    /// After `&&`: run only if the previous segment succeeded.
    And,
    /// After `||`: run only if the previous segment failed.
    Or,
}

impl Connector {
    /// Whether a segment with this connector runs given the previous exit code.
    pub fn should_run(self, previous: ExitCode) -> bool {
        match self {
            Connector::Always => true,
            Connector::And => previous == 0,
            Connector::Or => previous != 0,
        }
    }
}

/// A pipeline together with the connector that precedes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub commands: Vec<Command>,
    pub connector: Connector,
    pub background: bool,
}

/// The full parse of one input line: pipelines joined by `;`, `&&`, `||` and `&`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    pub segments: Vec<Segment>,
}

impl CommandList {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
