//! Interactive shell helpers.
//!
//! The utilities present in this module read commands from a terminal and
//! print server responses in a readable form.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::{
    Command, CommandError,
    codec::Value,
    protocol::{Response, SqlResult, consts::RequestType},
    schema::SchemaSnapshot,
};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Prompts for one command. Returns `Ok(None)` at end of input.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Option<Command>, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(None);
    }
    Ok(Some(Command::try_from(s.as_str())?))
}

/// Formats a response for the terminal.
pub fn render(response: &Response) -> String {
    let is_sql = response.request_type.is_some_and(RequestType::is_sql);
    if is_sql {
        if let Ok(result) = response.sql_result() {
            return render_sql(&result);
        }
    }
    match response.data() {
        Some(Value::Array(items)) if items.is_empty() => "(empty)".to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => "ok".to_string(),
    }
}

fn render_sql(result: &SqlResult) -> String {
    match result {
        SqlResult::RowCount {
            count,
            autoincrement_ids,
        } if autoincrement_ids.is_empty() => format!("{count} rows affected"),
        SqlResult::RowCount {
            count,
            autoincrement_ids,
        } => format!(
            "{count} rows affected, new ids {}",
            Value::Array(autoincrement_ids.clone())
        ),
        SqlResult::Rows { columns, rows } => {
            let mut out = columns
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(" | ");
            for row in rows {
                out.push('\n');
                out.push_str(
                    &row.iter()
                        .map(Value::to_string)
                        .collect::<Vec<_>>()
                        .join(" | "),
                );
            }
            out
        }
    }
}

/// Lists the spaces in `snapshot`, one per line, sorted by name.
pub fn render_schema(snapshot: &SchemaSnapshot) -> String {
    let mut names: Vec<&str> = snapshot.space_names().collect();
    names.sort_unstable();
    let mut out = format!("schema version {}", snapshot.version);
    for name in names {
        if let Ok(space) = snapshot.space(name) {
            let indexes = space
                .indexes
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("\n{name} (#{}) [{indexes}]", space.id));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::protocol::consts::key;

    fn response(request_type: RequestType, body: Vec<(u8, Value)>) -> Response {
        Response {
            sync: 1,
            schema_version: None,
            request_type: Some(request_type),
            body: body.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        let cmd = prompt(&input[..], &mut output).unwrap();
        assert!(matches!(cmd, Some(Command::Exit)));

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_ends_at_eof() {
        let mut output = Vec::new();
        assert!(prompt(&b""[..], &mut output).unwrap().is_none());
    }

    #[test]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        let err = prompt(&input[..], &mut output).unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }

    #[test]
    fn renders_tuples() {
        let r = response(
            RequestType::Select,
            vec![(
                key::DATA,
                Value::Array(vec![Value::Array(vec![Value::from(1), Value::from("ann")])]),
            )],
        );
        assert_eq!(render(&r), "[1, \"ann\"]");
        assert_eq!(
            render(&response(RequestType::Select, vec![(key::DATA, Value::Array(vec![]))])),
            "(empty)"
        );
        assert_eq!(render(&response(RequestType::Ping, vec![])), "ok");
    }

    #[test]
    fn renders_sql_row_count() {
        let r = response(
            RequestType::Execute,
            vec![(
                key::SQL_INFO,
                Value::Map(vec![(
                    Value::from(key::SQL_INFO_ROW_COUNT),
                    Value::from(2),
                )]),
            )],
        );
        assert_eq!(render(&r), "2 rows affected");
    }
}
