//! Commands typed into the interactive shell.
//!
//! A line is either a dot-command handled by the shell itself or a request
//! sent to the server:
//!
//! - `.exit`, `.schema`, `.ping`
//! - `eval <expression>`
//! - `call <function> [args...]`
//! - `sql <statement>`
//! - `select <space> [key...]`, `delete <space> <key...>`
//! - `insert <space> <values...>`, `replace <space> <values...>`
//!
//! Arguments are literals separated by spaces: integers, floats, `true`,
//! `false`, `null`, double-quoted strings and UUIDs. Any other bare word is
//! taken as a string.
//!
//! # Example
//! ```rust
//! use tarn::Command;
//!
//! let cmd: Command = ".exit".try_into().unwrap();
//! assert!(matches!(cmd, Command::Exit));
//! ```
use thiserror::Error;
use uuid::Uuid;

use crate::{
    codec::Value,
    protocol::{Request, consts::IteratorType},
};

/// Rows returned by a shell `select`.
pub const SELECT_LIMIT: u32 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("no command provided")]
    Empty,
}

#[derive(Debug)]
pub enum Command {
    /// Close the client and leave the shell.
    Exit,
    /// Print the cached spaces.
    Schema,
    Request(Request),
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        match word.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            ".exit" => Ok(Command::Exit),
            ".schema" => Ok(Command::Schema),
            ".ping" => Ok(Command::Request(Request::ping())),
            "eval" => Ok(Command::Request(Request::eval(
                required(word, rest, "an expression. Example: eval return box.info.version")?,
                Vec::new(),
            ))),
            "sql" => Ok(Command::Request(Request::execute(
                required(word, rest, "a statement. Example: sql SELECT 1")?,
                Vec::new(),
            ))),
            "call" => {
                let mut args = tokenize(rest)?.into_iter();
                let function = match args.next() {
                    Some(Value::String(name)) => name,
                    _ => {
                        return Err(invalid(word, "requires a function name. Example: call f 1 2"));
                    }
                };
                Ok(Command::Request(Request::call(&function, args.collect())))
            }
            "select" | "delete" | "insert" | "replace" => {
                let (space, values) = space_and_values(word, rest)?;
                let request = match word.to_lowercase().as_str() {
                    "select" => {
                        let iterator = if values.is_empty() {
                            IteratorType::All
                        } else {
                            IteratorType::Eq
                        };
                        Request::select(space, 0u32, values, 0, SELECT_LIMIT, iterator)
                    }
                    "delete" if values.is_empty() => {
                        return Err(invalid(word, "requires a key. Example: delete users 1"));
                    }
                    "delete" => Request::delete(space, 0u32, values),
                    "insert" => Request::insert(space, values),
                    _ => Request::replace(space, values),
                };
                Ok(Command::Request(request))
            }
            _ => Err(CommandError::UnrecognizedCommand(line.to_string())),
        }
    }
}

fn invalid(command: &str, reason: &str) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

fn required<'a>(command: &str, rest: &'a str, what: &str) -> Result<&'a str, CommandError> {
    if rest.is_empty() {
        Err(invalid(command, &format!("requires {what}")))
    } else {
        Ok(rest)
    }
}

fn space_and_values(command: &str, rest: &str) -> Result<(String, Vec<Value>), CommandError> {
    let (space, values) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if space.is_empty() {
        return Err(invalid(
            command,
            &format!("requires a space name. Example: {command} users 1"),
        ));
    }
    Ok((space.to_string(), tokenize(values)?))
}

/// Splits `input` into literal values.
pub fn tokenize(input: &str) -> Result<Vec<Value>, CommandError> {
    let mut values = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some(escaped) => s.push(escaped),
                        None => return Err(CommandError::UnterminatedString),
                    },
                    Some(c) => s.push(c),
                    None => return Err(CommandError::UnterminatedString),
                }
            }
            values.push(Value::String(s));
            continue;
        }

        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            word.push(c);
            chars.next();
        }
        values.push(literal(&word));
    }
    Ok(values)
}

fn literal(word: &str) -> Value {
    match word {
        "null" | "nil" => return Value::Nil,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = word.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(u) = word.parse::<u64>() {
        return Value::from(u);
    }
    if word.contains('.') {
        if let Ok(f) = word.parse::<f64>() {
            return Value::from(f);
        }
    }
    if word.len() == 36 {
        if let Ok(uuid) = Uuid::parse_str(word) {
            return Value::Uuid(uuid);
        }
    }
    Value::from(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ToWireMessage, consts::RequestType};

    fn request(line: &str) -> Request {
        match Command::try_from(line).unwrap() {
            Command::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[test]
    fn dot_commands() {
        assert!(matches!(Command::try_from(".exit"), Ok(Command::Exit)));
        assert!(matches!(Command::try_from("  .schema\n"), Ok(Command::Schema)));
        assert_eq!(request(".ping").request_type(), RequestType::Ping);
        assert_eq!(Command::try_from("   ").unwrap_err(), CommandError::Empty);
        assert_eq!(
            Command::try_from(".nope").unwrap_err(),
            CommandError::UnrecognizedCommand(".nope".into())
        );
    }

    #[test]
    fn requests_from_lines() {
        assert_eq!(request("eval return 1 + 1").request_type(), RequestType::Eval);
        assert_eq!(request("SQL SELECT 1").request_type(), RequestType::Execute);
        assert_eq!(request("call f 1").request_type(), RequestType::Call);

        let select = request("select users 1");
        assert_eq!(select.request_type(), RequestType::Select);
        assert_eq!(select.space_names(), vec!["users"]);
        assert!(select.is_schema_bound());

        assert_eq!(request("insert users 1 \"ann\"").request_type(), RequestType::Insert);
        assert_eq!(request("replace users 1").request_type(), RequestType::Replace);
        assert_eq!(request("delete users 1").request_type(), RequestType::Delete);
    }

    #[test]
    fn call_arguments_reach_the_body() {
        let message = request("call box.space.users:count").to_wire_message(0).unwrap();
        assert_eq!(
            message.body.values().find_map(Value::as_str),
            Some("box.space.users:count")
        );
    }

    #[test]
    fn missing_arguments_are_rejected() {
        for line in ["eval", "sql", "call", "select", "delete users"] {
            assert!(
                matches!(
                    Command::try_from(line),
                    Err(CommandError::InvalidCommandArguments { .. })
                ),
                "{line}"
            );
        }
    }

    #[test]
    fn literals() {
        let values = tokenize(
            r#"1 -2 18446744073709551615 2.5 true null "a b" word 6f1a0e7c-3f3c-4bde-8d4a-3a1c5e9f2b10"#,
        )
        .unwrap();
        assert_eq!(values[0], Value::from(1));
        assert_eq!(values[1], Value::from(-2));
        assert_eq!(values[2], Value::from(u64::MAX));
        assert_eq!(values[3], Value::from(2.5));
        assert_eq!(values[4], Value::Bool(true));
        assert_eq!(values[5], Value::Nil);
        assert_eq!(values[6], Value::from("a b"));
        assert_eq!(values[7], Value::from("word"));
        assert!(matches!(values[8], Value::Uuid(_)));

        assert_eq!(tokenize("\"open").unwrap_err(), CommandError::UnterminatedString);
    }
}
