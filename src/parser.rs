//! Pipeline construction: turns the token stream into [`Command`] descriptors.
//!
//! Variables are expanded here, at build time, against the lookup supplied by the
//! caller. Nothing is deferred to execution: a `$NAME` that is absent becomes an
//! empty argument.

use crate::command::{Command, CommandList, Connector, Segment};
use crate::lexer::{Token, TokenKind};
use std::path::PathBuf;

pub use crate::lexer::ParseError;

struct PipelineBuilder<F> {
    tokens: Vec<Token>,
    pos: usize,
    lookup: F,
    segments: Vec<Segment>,
    commands: Vec<Command>,
    current: Command,
    connector: Connector,
    /// Operator that left the builder waiting for another command (`|`, `&&`, `||`).
    pending_operator: Option<(String, usize)>,
    /// Offset of the first redirection of the current command.
    redirect_offset: Option<usize>,
}

impl<F> PipelineBuilder<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(tokens: Vec<Token>, lookup: F) -> Self {
        Self {
            tokens,
            pos: 0,
            lookup,
            segments: Vec::new(),
            commands: Vec::new(),
            current: Command::default(),
            connector: Connector::Always,
            pending_operator: None,
            redirect_offset: None,
        }
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn build_list(mut self) -> Result<CommandList, ParseError> {
        while let Some(token) = self.consume() {
            match token.kind {
                TokenKind::Word => self.push_arg(token.value),
                TokenKind::Variable => {
                    let value = self.expand(&token.value);
                    self.push_arg(value);
                }
                TokenKind::Pipe => self.pipe(&token)?,
                TokenKind::RedirectIn => {
                    if !self.commands.is_empty() {
                        return Err(ParseError::new(
                            "input redirection only allowed on the first command",
                            token.offset,
                        ));
                    }
                    let path = self.redirect_target(&token, "missing input file")?;
                    self.current.stdin = Some(path);
                }
                TokenKind::RedirectOut | TokenKind::RedirectAppend => {
                    let path = self.redirect_target(&token, "missing output file")?;
                    self.current.stdout = Some(path);
                    self.current.append_stdout = token.kind == TokenKind::RedirectAppend;
                }
                TokenKind::Semicolon => self.finish_segment(&token, false, Connector::Always)?,
                TokenKind::Background => self.finish_segment(&token, true, Connector::Always)?,
                TokenKind::And => {
                    self.finish_segment(&token, false, Connector::And)?;
                    self.pending_operator = Some((token.value, token.offset));
                }
                TokenKind::Or => {
                    self.finish_segment(&token, false, Connector::Or)?;
                    self.pending_operator = Some((token.value, token.offset));
                }
            }
        }

        if self.current.args.is_empty() {
            if let Some(offset) = self.redirect_offset {
                return Err(ParseError::new("redirection without command", offset));
            }
            if let Some((op, offset)) = self.pending_operator.take() {
                return Err(ParseError::new(format!("missing command after {op}"), offset));
            }
        } else {
            self.commands.push(std::mem::take(&mut self.current));
        }
        if !self.commands.is_empty() {
            self.segments.push(Segment {
                commands: std::mem::take(&mut self.commands),
                connector: self.connector,
                background: false,
            });
        }

        Ok(CommandList {
            segments: self.segments,
        })
    }

    fn expand(&self, name: &str) -> String {
        (self.lookup)(name).unwrap_or_default()
    }

    fn push_arg(&mut self, arg: String) {
        self.current.args.push(arg);
        self.pending_operator = None;
    }

    fn pipe(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.current.args.is_empty() {
            return Err(ParseError::new("empty command before pipe", token.offset));
        }
        if self.current.stdout.is_some() {
            return Err(ParseError::new(
                "output redirection only allowed on the last command",
                token.offset,
            ));
        }
        self.commands.push(std::mem::take(&mut self.current));
        self.redirect_offset = None;
        self.pending_operator = Some((token.value.clone(), token.offset));
        Ok(())
    }

    /// Reads the filename following a redirection operator.
    fn redirect_target(&mut self, op: &Token, missing: &str) -> Result<PathBuf, ParseError> {
        self.redirect_offset.get_or_insert(op.offset);
        let target = match self.tokens.get(self.pos) {
            Some(t) if t.kind == TokenKind::Word => t.value.clone(),
            Some(t) if t.kind == TokenKind::Variable => self.expand(&t.value),
            _ => return Err(ParseError::new(missing, op.offset)),
        };
        self.pos += 1;
        Ok(PathBuf::from(target))
    }

    fn finish_segment(
        &mut self,
        token: &Token,
        background: bool,
        next: Connector,
    ) -> Result<(), ParseError> {
        if self.current.args.is_empty() {
            if let Some(offset) = self.redirect_offset {
                return Err(ParseError::new("redirection without command", offset));
            }
            if let Some((op, offset)) = &self.pending_operator {
                return Err(ParseError::new(format!("missing command after {op}"), *offset));
            }
            return Err(ParseError::new(
                format!("empty command before {}", token.value),
                token.offset,
            ));
        }

        let mut current = std::mem::take(&mut self.current);
        current.background = background;
        self.commands.push(current);
        if background {
            for command in &mut self.commands {
                command.background = true;
            }
        }
        self.segments.push(Segment {
            commands: std::mem::take(&mut self.commands),
            connector: self.connector,
            background,
        });
        self.connector = next;
        self.redirect_offset = None;
        self.pending_operator = None;
        Ok(())
    }
}

/// Builds the full command list of a line, expanding `$NAME` through `lookup`.
pub fn build_list<F>(tokens: Vec<Token>, lookup: F) -> Result<CommandList, ParseError>
where
    F: Fn(&str) -> Option<String>,
{
    PipelineBuilder::new(tokens, lookup).build_list()
}

/// Builds a single pipeline, expanding variables against the process environment.
///
/// Lines that contain more than one segment (`;`, `&&`, `||`, or a `&` followed by
/// more commands) are rejected; use [`build_list`] for those.
pub fn build(tokens: Vec<Token>) -> Result<Vec<Command>, ParseError> {
    let second_segment_at = tokens
        .iter()
        .filter(|t| t.kind.is_separator())
        .map(|t| t.offset)
        .next()
        .unwrap_or(0);
    let mut list = build_list(tokens, |name| std::env::var(name).ok())?;
    match list.segments.len() {
        0 => Ok(Vec::new()),
        1 => Ok(list.segments.remove(0).commands),
        n => Err(ParseError::new(
            format!("expected a single pipeline, found {n} segments"),
            second_segment_at,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use std::collections::HashMap;

    fn parse(line: &str) -> Result<CommandList, ParseError> {
        let vars: HashMap<&str, &str> = HashMap::from([("USER_NAME", "ada"), ("OUT", "log.txt")]);
        build_list(tokenize(line).unwrap(), |name| {
            vars.get(name).map(|v| v.to_string())
        })
    }

    fn args(command: &Command) -> Vec<&str> {
        command.args.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_three_stage_pipeline() {
        let commands = build(tokenize("cmd1 | cmd2 -x | cmd3").unwrap()).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(args(&commands[0]), vec!["cmd1"]);
        assert_eq!(args(&commands[1]), vec!["cmd2", "-x"]);
        assert_eq!(args(&commands[2]), vec!["cmd3"]);
        assert!(commands.iter().all(|c| !c.args.is_empty()));
    }

    #[test]
    fn test_redirections_attach_to_first_and_last() {
        let list = parse("sort < in.txt | uniq >> out.txt").unwrap();
        let commands = &list.segments[0].commands;
        assert_eq!(commands[0].stdin, Some(PathBuf::from("in.txt")));
        assert_eq!(commands[1].stdout, Some(PathBuf::from("out.txt")));
        assert!(commands[1].append_stdout);
    }

    #[test]
    fn test_truncating_redirect_clears_append() {
        let list = parse("echo hi >> a > b").unwrap();
        let command = &list.segments[0].commands[0];
        assert_eq!(command.stdout, Some(PathBuf::from("b")));
        assert!(!command.append_stdout);
    }

    #[test]
    fn test_variables_expand_at_build_time() {
        let list = parse("echo $USER_NAME $MISSING > $OUT").unwrap();
        let command = &list.segments[0].commands[0];
        assert_eq!(args(command), vec!["echo", "ada", ""]);
        assert_eq!(command.stdout, Some(PathBuf::from("log.txt")));
    }

    #[test]
    fn test_empty_command_before_pipe() {
        let err = parse("ls | | wc").unwrap_err();
        assert_eq!(err.message, "empty command before pipe");
        assert_eq!(err.position, 5);
    }

    #[test]
    fn test_missing_redirect_targets() {
        assert_eq!(parse("cat <").unwrap_err().message, "missing input file");
        assert_eq!(parse("ls >").unwrap_err().message, "missing output file");
        assert_eq!(parse("ls >> | wc").unwrap_err().message, "missing output file");
    }

    #[test]
    fn test_inner_stage_redirects_are_rejected() {
        assert!(parse("a | b < in").is_err());
        assert!(parse("a > out | b").is_err());
    }

    #[test]
    fn test_dangling_operators() {
        assert_eq!(parse("ls |").unwrap_err().message, "missing command after |");
        assert_eq!(parse("true &&").unwrap_err().message, "missing command after &&");
        assert_eq!(parse("> out").unwrap_err().message, "redirection without command");
        assert_eq!(parse("; ls").unwrap_err().message, "empty command before ;");
    }

    #[test]
    fn test_segments_and_connectors() {
        let list = parse("a; b && c || d").unwrap();
        let connectors: Vec<Connector> = list.segments.iter().map(|s| s.connector).collect();
        assert_eq!(
            connectors,
            vec![Connector::Always, Connector::Always, Connector::And, Connector::Or]
        );
        assert_eq!(parse("a;").unwrap().segments.len(), 1);
    }

    #[test]
    fn test_background_marks_segment_and_commands() {
        let list = parse("sleep 1 | cat & echo done").unwrap();
        assert_eq!(list.segments.len(), 2);
        let first = &list.segments[0];
        assert!(first.background);
        assert!(first.commands.iter().all(|c| c.background));
        assert!(!list.segments[1].background);
        assert_eq!(list.segments[1].connector, Connector::Always);
    }

    #[test]
    fn test_build_rejects_command_lists() {
        let err = build(tokenize("a; b").unwrap()).unwrap_err();
        assert_eq!(err.position, 1);
        assert!(build(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_build_expands_from_process_environment() {
        let path = std::env::var("PATH").unwrap_or_default();
        let commands = build(tokenize("echo $PATH").unwrap()).unwrap();
        assert_eq!(commands[0].args[1], path);
    }
}
