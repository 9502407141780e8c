//! Shell-style command line tokenizer
//!
//! Splits a command line the way a POSIX shell would for simple commands:
//! single quotes, double quotes, backslash escapes and leading `KEY=VALUE`
//! assignments. Anything that needs a real shell to interpret (pipes,
//! redirections, variable expansion, globbing, unterminated quotes) is
//! reported as an error so callers can hand the line to `/bin/sh -c`.

use thiserror::Error;

/// Characters that require a shell when they appear unquoted
const SHELL_CHARS: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '*', '?', '[', ']', '{', '}', '!',
];

/// Characters that only matter to a shell at the start of a word
const WORD_START_SHELL_CHARS: &[char] = &['#', '~'];

/// Reasons a command line cannot be split without a shell
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizeError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("shell character {0:?} found")]
    ShellCharacter(char),

    #[error("trailing backslash")]
    TrailingEscape,

    #[error("no command found")]
    Empty,
}

/// A tokenized command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens {
    /// Leading environment assignments in order of appearance
    pub env: Vec<(String, String)>,
    /// Program followed by its arguments
    pub args: Vec<String>,
}

struct Word {
    text: String,
    /// Byte offset of the first quoted or escaped character
    first_quoted: Option<usize>,
}

impl Word {
    fn new() -> Self {
        Self {
            text: String::new(),
            first_quoted: None,
        }
    }

    fn mark_quoted(&mut self) {
        if self.first_quoted.is_none() {
            self.first_quoted = Some(self.text.len());
        }
    }

    /// `NAME=value` where the name and `=` were written unquoted
    fn as_assignment(&self) -> Option<(String, String)> {
        let eq = self.text.find('=')?;
        if let Some(q) = self.first_quoted {
            if q <= eq {
                return None;
            }
        }
        let name = &self.text[..eq];
        let mut chars = name.chars();
        let first = chars.next()?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some((name.to_string(), self.text[eq + 1..].to_string()))
    }
}

/// Split a command line into environment assignments and arguments
pub fn split_command_line(line: &str) -> Result<Tokens, TokenizeError> {
    let words = split_words(line)?;

    let mut tokens = Tokens::default();
    let mut in_env = true;
    for word in words {
        if in_env {
            if let Some(assignment) = word.as_assignment() {
                tokens.env.push(assignment);
                continue;
            }
            in_env = false;
        }
        tokens.args.push(word.text);
    }

    if tokens.args.is_empty() {
        return Err(TokenizeError::Empty);
    }
    Ok(tokens)
}

fn split_words(line: &str) -> Result<Vec<Word>, TokenizeError> {
    let mut words = Vec::new();
    let mut word: Option<Word> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                if let Some(w) = word.take() {
                    words.push(w);
                }
            }
            '\'' => {
                let w = word.get_or_insert_with(Word::new);
                w.mark_quoted();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => w.text.push(ch),
                        None => return Err(TokenizeError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                let w = word.get_or_insert_with(Word::new);
                w.mark_quoted();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('\n') => {}
                            Some(ch @ ('$' | '`' | '"' | '\\')) => w.text.push(ch),
                            Some(ch) => {
                                w.text.push('\\');
                                w.text.push(ch);
                            }
                            None => return Err(TokenizeError::UnterminatedQuote('"')),
                        },
                        Some(ch @ ('$' | '`')) => return Err(TokenizeError::ShellCharacter(ch)),
                        Some(ch) => w.text.push(ch),
                        None => return Err(TokenizeError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(ch) => {
                    let w = word.get_or_insert_with(Word::new);
                    w.mark_quoted();
                    w.text.push(ch);
                }
                None => return Err(TokenizeError::TrailingEscape),
            },
            c if SHELL_CHARS.contains(&c) => return Err(TokenizeError::ShellCharacter(c)),
            c if word.is_none() && WORD_START_SHELL_CHARS.contains(&c) => {
                return Err(TokenizeError::ShellCharacter(c))
            }
            c => word.get_or_insert_with(Word::new).text.push(c),
        }
    }

    if let Some(w) = word {
        words.push(w);
    }
    Ok(words)
}
