//! A line-oriented shell that runs pipelines of external programs.
//!
//! A command line goes through three stages. The [`lexer`] splits it into tokens.
//! The [`parser`] then builds the pipelines, expanding `$NAME` references as it goes.
//! Finally the [`executor`] starts one process per pipeline stage, all in a single
//! process group, and waits for every one of them.
//!
//! Running groups and jobs are tracked in a shared [`Registry`], which is also how
//! signals and cancellation reach a running pipeline. [`Interpreter`] puts it all
//! together with builtins, aliases, history and an interactive prompt.

mod builtin;
pub mod alias;
pub mod cancel;
pub mod command;
pub mod completion;
pub mod config;
pub mod env;
pub mod executor;
mod external;
pub mod history;
pub mod interpreter;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod prompt;
pub mod registry;
pub mod relay;
pub mod terminal;

pub use cancel::{CancelToken, ExecContext};
pub use command::{Command, ExitCode};
pub use executor::{ExecError, Executor, PipelineStatus, RunningPipeline, SpawnOptions};
pub use interpreter::{Interpreter, ShellContext};
pub use lexer::{ParseError, Token, TokenKind, tokenize};
pub use parser::{build, build_list};
pub use registry::{JobStatus, Registry, SignalKind};
