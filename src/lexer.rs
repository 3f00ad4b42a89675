//! A module implementing lexical analysis (tokenization) for the command language.
//!
//! The scanner makes a single pass over the line and keeps one piece of state besides
//! the word it is accumulating: the quote character that opened the current quoted
//! region, if any. Quotes suppress every operator, `$` and whitespace.

use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

/// The kind of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A plain or quoted word.
    Word,
    /// The pipe operator, `|`.
    Pipe,
    /// Input redirection, `<`.
    RedirectIn,
    /// Output redirection with truncation, `>`.
    RedirectOut,
    /// Output redirection with append, `>>`.
    RedirectAppend,
    /// A lone `&`, which runs the preceding pipeline in the background.
    Background,
    /// `&&`: run the next pipeline only if the previous one succeeded.
    And,
    /// `||`: run the next pipeline only if the previous one failed.
    Or,
    /// `;`: run pipelines one after another.
    Semicolon,
    /// A `$NAME` reference. The token value is the name without the `$`.
    Variable,
}

impl TokenKind {
    /// Whether the token separates two pipeline segments.
    pub fn is_separator(self) -> bool {
        matches!(
            self,
            TokenKind::Semicolon | TokenKind::And | TokenKind::Or | TokenKind::Background
        )
    }
}

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    /// Byte offset of the token's first character in the input line.
    pub offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, value: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            offset,
        }
    }

    pub fn word(value: impl Into<String>, offset: usize) -> Self {
        Self::new(TokenKind::Word, value, offset)
    }
}

/// Malformed command syntax, reported with the offending position.
///
/// Lexer positions are byte offsets into the line; builder positions are the offset
/// of the token that triggered the error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

struct LexingFSM<'a> {
    line: &'a str,
    chars: Peekable<CharIndices<'a>>,
    quote: Option<char>,
    buffer: String,
    word_start: Option<usize>,
    out: Vec<Token>,
}

impl<'a> LexingFSM<'a> {
    fn new(line: &'a str) -> Self {
        LexingFSM {
            line,
            chars: line.char_indices().peekable(),
            quote: None,
            buffer: String::new(),
            word_start: None,
            out: Vec::new(),
        }
    }

    fn make_tokens(mut self) -> Result<Vec<Token>, ParseError> {
        while let Some((pos, ch)) = self.read_char() {
            match self.quote {
                Some(quote) => self.handle_quoted(pos, ch, quote),
                None => self.handle_unquoted(pos, ch),
            }
        }

        if self.quote.is_some() {
            return Err(ParseError::new("unclosed quote", self.line.len()));
        }

        self.flush_word();
        Ok(self.out)
    }

    fn read_char(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    /// Consumes the next character if it equals `expected`.
    fn next_is(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.read_char();
            true
        } else {
            false
        }
    }

    fn handle_quoted(&mut self, pos: usize, ch: char, quote: char) {
        if ch == quote {
            self.quote = None;
            let start = self.word_start.take().unwrap_or(pos);
            self.out
                .push(Token::word(std::mem::take(&mut self.buffer), start));
        } else {
            self.buffer.push(ch);
        }
    }

    fn handle_unquoted(&mut self, pos: usize, ch: char) {
        match ch {
            '\'' | '"' => {
                self.word_start.get_or_insert(pos);
                self.quote = Some(ch);
            }
            '|' => {
                self.flush_word();
                if self.next_is('|') {
                    self.push_operator(TokenKind::Or, "||", pos);
                } else {
                    self.push_operator(TokenKind::Pipe, "|", pos);
                }
            }
            '>' => {
                self.flush_word();
                if self.next_is('>') {
                    self.push_operator(TokenKind::RedirectAppend, ">>", pos);
                } else {
                    self.push_operator(TokenKind::RedirectOut, ">", pos);
                }
            }
            '<' => {
                self.flush_word();
                self.push_operator(TokenKind::RedirectIn, "<", pos);
            }
            '&' => {
                self.flush_word();
                if self.next_is('&') {
                    self.push_operator(TokenKind::And, "&&", pos);
                } else {
                    self.push_operator(TokenKind::Background, "&", pos);
                }
            }
            ';' => {
                self.flush_word();
                self.push_operator(TokenKind::Semicolon, ";", pos);
            }
            '$' => match self.peek_char() {
                Some(c) if c.is_ascii_alphabetic() => {
                    self.flush_word();
                    let name = self.read_variable_name();
                    self.out.push(Token::new(TokenKind::Variable, name, pos));
                }
                // Not a variable reference: keep the dollar sign as text.
                _ => self.push_char(pos, '$'),
            },
            ' ' | '\t' | '\n' | '\r' => self.flush_word(),
            c => self.push_char(pos, c),
        }
    }

    fn read_variable_name(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.peek_char() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            self.read_char();
        }
        name
    }

    fn push_char(&mut self, pos: usize, ch: char) {
        self.word_start.get_or_insert(pos);
        self.buffer.push(ch);
    }

    fn push_operator(&mut self, kind: TokenKind, symbol: &str, pos: usize) {
        self.out.push(Token::new(kind, symbol, pos));
    }

    fn flush_word(&mut self) {
        if let Some(start) = self.word_start.take() {
            self.out
                .push(Token::word(std::mem::take(&mut self.buffer), start));
        }
    }
}

/// Splits one input line into tokens.
///
/// Fails only when the line ends inside a quoted region; the error position is then
/// the length of the line.
pub fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    LexingFSM::new(line).make_tokens()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(tokens: &[Token]) -> Vec<(TokenKind, &str)> {
        tokens.iter().map(|t| (t.kind, t.value.as_str())).collect()
    }

    #[test]
    fn test_pipe_inside_quotes_is_a_word() {
        let tokens = tokenize(r#"echo "a|b" > out.txt"#).unwrap();
        assert_eq!(
            shape(&tokens),
            vec![
                (TokenKind::Word, "echo"),
                (TokenKind::Word, "a|b"),
                (TokenKind::RedirectOut, ">"),
                (TokenKind::Word, "out.txt"),
            ]
        );
    }

    #[test]
    fn test_double_greater_is_one_append_token() {
        let tokens = tokenize("a >> b").unwrap();
        assert_eq!(
            shape(&tokens),
            vec![
                (TokenKind::Word, "a"),
                (TokenKind::RedirectAppend, ">>"),
                (TokenKind::Word, "b"),
            ]
        );
    }

    #[test]
    fn test_unclosed_quote_reports_input_length() {
        let line = r#"echo "abc"#;
        let err = tokenize(line).unwrap_err();
        assert_eq!(err.message, "unclosed quote");
        assert_eq!(err.position, line.len());
    }

    #[test]
    fn test_quote_closes_only_on_same_character() {
        let tokens = tokenize(r#"echo "it's" 'say "hi"'"#).unwrap();
        assert_eq!(
            shape(&tokens),
            vec![
                (TokenKind::Word, "echo"),
                (TokenKind::Word, "it's"),
                (TokenKind::Word, "say \"hi\""),
            ]
        );
    }

    #[test]
    fn test_empty_quotes_produce_empty_word() {
        let tokens = tokenize(r#"printf """#).unwrap();
        assert_eq!(
            shape(&tokens),
            vec![(TokenKind::Word, "printf"), (TokenKind::Word, "")]
        );
    }

    #[test]
    fn test_operators_without_spaces() {
        let tokens = tokenize("a|b<in>out;c&&d||e&").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::Pipe,
                TokenKind::Word,
                TokenKind::RedirectIn,
                TokenKind::Word,
                TokenKind::RedirectOut,
                TokenKind::Word,
                TokenKind::Semicolon,
                TokenKind::Word,
                TokenKind::And,
                TokenKind::Word,
                TokenKind::Or,
                TokenKind::Word,
                TokenKind::Background,
            ]
        );
    }

    #[test]
    fn test_variable_name_is_longest_identifier_run() {
        let tokens = tokenize("echo $HOME_DIR2/x").unwrap();
        assert_eq!(
            shape(&tokens),
            vec![
                (TokenKind::Word, "echo"),
                (TokenKind::Variable, "HOME_DIR2"),
                (TokenKind::Word, "/x"),
            ]
        );
    }

    #[test]
    fn test_dollar_without_letter_is_literal() {
        let tokens = tokenize("echo $1 cost$ $").unwrap();
        assert_eq!(
            shape(&tokens),
            vec![
                (TokenKind::Word, "echo"),
                (TokenKind::Word, "$1"),
                (TokenKind::Word, "cost$"),
                (TokenKind::Word, "$"),
            ]
        );
    }

    #[test]
    fn test_dollar_inside_quotes_is_not_expanded() {
        let tokens = tokenize("echo '$HOME'").unwrap();
        assert_eq!(
            shape(&tokens),
            vec![(TokenKind::Word, "echo"), (TokenKind::Word, "$HOME")]
        );
    }

    #[test]
    fn test_whitespace_never_becomes_a_token() {
        assert!(tokenize(" \t \r\n").unwrap().is_empty());
    }

    #[test]
    fn test_offsets_point_into_the_line() {
        let tokens = tokenize("ls  | wc").unwrap();
        let offsets: Vec<usize> = tokens.iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![0, 4, 6]);
    }
}
