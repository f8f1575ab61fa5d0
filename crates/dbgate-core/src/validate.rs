//! Advisory pre-dispatch validation of caller-supplied query text.
//!
//! This is not a parser. A small lexer skips string literals and comments,
//! then a few token-level rules catch statements that should never reach
//! a source database:
//!
//! | Rule | Dialects |
//! |------|----------|
//! | `CREATE` / `ALTER` / `DROP` `DATABASE` or `SCHEMA` | all (MongoDB: `dropDatabase`) |
//! | backtick-quoted identifiers | PostgreSQL |
//! | double-quoted identifier in identifier position | MySQL |
//! | query text that is not a JSON command document | MongoDB |
//!
//! For MySQL, a double-quoted token counts as an identifier when it follows
//! `FROM`, `JOIN`, `INTO`, `UPDATE` or `TABLE`, or touches a `.`. Anywhere
//! else it is a valid MySQL string literal and is left alone.

use serde_json::Value;
use thiserror::Error;

use crate::models::Dialect;

const DDL_VERBS: &[&str] = &["CREATE", "ALTER", "DROP"];
const DDL_OBJECTS: &[&str] = &["DATABASE", "SCHEMA"];
const IDENT_CONTEXT: &[&str] = &["FROM", "JOIN", "INTO", "UPDATE", "TABLE"];
const SQL_LEADS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "CREATE", "ALTER", "DROP", "SHOW", "EXPLAIN",
];
const MONGO_DDL_COMMANDS: &[&str] = &["dropDatabase"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("query text is empty")]
    Empty,
    #[error("database-level DDL is not allowed: {0}")]
    DatabaseDdl(String),
    #[error("{dialect} dialect mismatch: {detail}")]
    DialectMismatch { dialect: Dialect, detail: String },
    #[error("invalid command document: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    DoubleQuoted(String),
    Backtick,
    Dot,
    Other,
}

/// Validate `query` for `dialect`. `Ok` means dispatch may proceed.
pub fn validate_query(dialect: Dialect, query: &str) -> Result<(), ValidationError> {
    if query.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    match dialect {
        Dialect::Mongo => validate_command(query),
        Dialect::Postgres | Dialect::MySql => validate_sql(dialect, query),
    }
}

fn validate_sql(dialect: Dialect, query: &str) -> Result<(), ValidationError> {
    let tokens = tokenize(query, dialect);

    for pair in tokens.windows(2) {
        if let [Token::Word(verb), Token::Word(object)] = pair {
            if DDL_VERBS.contains(&verb.as_str()) && DDL_OBJECTS.contains(&object.as_str()) {
                return Err(ValidationError::DatabaseDdl(format!("{} {}", verb, object)));
            }
        }
    }

    match dialect {
        Dialect::Postgres => {
            if tokens.contains(&Token::Backtick) {
                return Err(ValidationError::DialectMismatch {
                    dialect,
                    detail: "backtick-quoted identifiers are MySQL syntax; use double quotes"
                        .to_string(),
                });
            }
        }
        Dialect::MySql => {
            for (i, token) in tokens.iter().enumerate() {
                let Token::DoubleQuoted(ident) = token else {
                    continue;
                };
                let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
                let next = tokens.get(i + 1);
                let after_keyword =
                    matches!(prev, Some(Token::Word(w)) if IDENT_CONTEXT.contains(&w.as_str()));
                let dotted = matches!(prev, Some(Token::Dot)) || matches!(next, Some(Token::Dot));
                if after_keyword || dotted {
                    return Err(ValidationError::DialectMismatch {
                        dialect,
                        detail: format!(
                            "double-quoted identifier \"{}\" is PostgreSQL syntax; use backticks",
                            ident
                        ),
                    });
                }
            }
        }
        Dialect::Mongo => {}
    }
    Ok(())
}

fn validate_command(query: &str) -> Result<(), ValidationError> {
    let parsed: Value = match serde_json::from_str(query) {
        Ok(v) => v,
        Err(e) => {
            let first = query
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_ascii_uppercase();
            if SQL_LEADS.contains(&first.as_str()) {
                return Err(ValidationError::DialectMismatch {
                    dialect: Dialect::Mongo,
                    detail: "SQL text sent to a document store; send a JSON command document"
                        .to_string(),
                });
            }
            return Err(ValidationError::InvalidCommand(e.to_string()));
        }
    };

    let Some(command) = parsed.as_object() else {
        return Err(ValidationError::InvalidCommand(
            "expected a JSON object".to_string(),
        ));
    };
    let Some(name) = command.keys().next() else {
        return Err(ValidationError::InvalidCommand(
            "command document is empty".to_string(),
        ));
    };
    if MONGO_DDL_COMMANDS.contains(&name.as_str()) {
        return Err(ValidationError::DatabaseDdl(name.clone()));
    }
    Ok(())
}

fn tokenize(query: &str, dialect: Dialect) -> Vec<Token> {
    let chars: Vec<char> = query.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '\'' => {
                let escapes = backslash_escapes(dialect, &chars, i, tokens.last());
                i = skip_quoted(&chars, i, '\'', escapes);
            }
            '-' if chars.get(i + 1) == Some(&'-') => i = skip_line(&chars, i),
            '#' if dialect == Dialect::MySql => i = skip_line(&chars, i),
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '"' => {
                let end = skip_quoted(&chars, i, '"', false);
                let inner: String = chars[i + 1..end.saturating_sub(1).max(i + 1)]
                    .iter()
                    .collect();
                tokens.push(Token::DoubleQuoted(inner));
                i = end;
            }
            '`' => {
                tokens.push(Token::Backtick);
                i = skip_quoted(&chars, i, '`', false);
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            _ => {
                tokens.push(Token::Other);
                i += 1;
            }
        }
    }
    tokens
}

/// Whether a backslash escapes the next character in the single-quoted
/// literal opened at `start`. MySQL literals always honour it; PostgreSQL
/// only inside `E'...'` escape strings, since `standard_conforming_strings`
/// is on by default.
fn backslash_escapes(dialect: Dialect, chars: &[char], start: usize, prev: Option<&Token>) -> bool {
    match dialect {
        Dialect::MySql => true,
        Dialect::Postgres => {
            let touching_e = start > 0 && matches!(chars[start - 1], 'e' | 'E');
            touching_e && matches!(prev, Some(Token::Word(w)) if w == "E")
        }
        Dialect::Mongo => false,
    }
}

/// Index just past the closing `quote` of a literal opened at `start`.
/// A doubled quote inside the literal is an escape.
fn skip_quoted(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if backslash_escapes && chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn skip_line(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}
