//! Splits an agent's configured `command:` string into an argv vector
//! without ever invoking a shell (spec §4.7, §9 "shell-free exec").
//!
//! Rules:
//! - Runs of unquoted whitespace separate tokens.
//! - `'...'` is a literal span: no character inside it is special, not even
//!   backslash.
//! - `"..."` is an escaping span: `\` escapes the very next character
//!   (including `"` and `\` itself); any other character passes through
//!   unchanged.
//! - Outside quotes, `\` escapes the next character the same way.
//! - An empty command produces an empty argv.
//! - An unterminated `'` or `"` is a hard error — never silently closed.

use serde::{Deserialize, Deserializer};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("unterminated single-quoted string")]
    UnterminatedSingleQuote,
    #[error("unterminated double-quoted string")]
    UnterminatedDoubleQuote,
    #[error("trailing backslash with nothing to escape")]
    TrailingBackslash,
}

/// Tokenize a command line into argv, shell-free.
pub fn tokenize(input: &str) -> Result<Vec<String>, TokenizeError> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            if in_token {
                args.push(std::mem::take(&mut cur));
                in_token = false;
            }
            i += 1;
            continue;
        }
        in_token = true;
        match c {
            '\'' => {
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(TokenizeError::UnterminatedSingleQuote),
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            cur.push(ch);
                            i += 1;
                        }
                    }
                }
            }
            '"' => {
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(TokenizeError::UnterminatedDoubleQuote),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => match chars.get(i + 1) {
                            None => return Err(TokenizeError::UnterminatedDoubleQuote),
                            Some(&next) => {
                                cur.push(next);
                                i += 2;
                            }
                        },
                        Some(&ch) => {
                            cur.push(ch);
                            i += 1;
                        }
                    }
                }
            }
            '\\' => match chars.get(i + 1) {
                None => return Err(TokenizeError::TrailingBackslash),
                Some(&next) => {
                    cur.push(next);
                    i += 2;
                }
            },
            other => {
                cur.push(other);
                i += 1;
            }
        }
    }
    if in_token {
        args.push(cur);
    }
    Ok(args)
}

/// A command as configured: either a scalar string to be tokenized, or a
/// sequence already split into argv (used verbatim, no quoting rules
/// applied to its elements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(pub Vec<String>);

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Scalar(String),
            Argv(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Scalar(s) => tokenize(&s).map(Command).map_err(serde::de::Error::custom),
            Repr::Argv(v) => Ok(Command(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("claude -p hello").unwrap(), vec!["claude", "-p", "hello"]);
    }

    #[test]
    fn collapses_runs_of_whitespace() {
        assert_eq!(tokenize("claude   -p\thello").unwrap(), vec!["claude", "-p", "hello"]);
    }

    #[test]
    fn single_quotes_are_fully_literal() {
        assert_eq!(tokenize(r#"echo 'a\tb  c'"#).unwrap(), vec!["echo", r#"a\tb  c"#]);
    }

    #[test]
    fn double_quotes_allow_escape_of_quote() {
        assert_eq!(tokenize(r#"echo "say \"hi\"""#).unwrap(), vec!["echo", r#"say "hi""#]);
    }

    #[test]
    fn double_quotes_preserve_inner_whitespace() {
        assert_eq!(tokenize(r#"echo "a b  c""#).unwrap(), vec!["echo", "a b  c"]);
    }

    #[test]
    fn unquoted_backslash_escapes_next_char() {
        assert_eq!(tokenize(r#"echo a\ b"#).unwrap(), vec!["echo", "a b"]);
    }

    #[test]
    fn unterminated_single_quote_is_error() {
        assert_eq!(tokenize("echo 'abc"), Err(TokenizeError::UnterminatedSingleQuote));
    }

    #[test]
    fn unterminated_double_quote_is_error() {
        assert_eq!(tokenize(r#"echo "abc"#), Err(TokenizeError::UnterminatedDoubleQuote));
    }

    #[test]
    fn trailing_backslash_is_error() {
        assert_eq!(tokenize(r"echo abc\"), Err(TokenizeError::TrailingBackslash));
    }

    #[test]
    fn empty_command_is_empty_argv() {
        assert_eq!(tokenize("").unwrap(), Vec::<String>::new());
        assert_eq!(tokenize("   ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn adjacent_quoted_spans_join_into_one_token() {
        assert_eq!(tokenize(r#"'foo'"bar""#).unwrap(), vec!["foobar"]);
    }
}
