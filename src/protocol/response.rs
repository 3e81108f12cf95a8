use std::collections::BTreeMap;

use crate::{
    Error, Result, ServerError,
    codec::{CodecError, Value},
    error::ConnectionError,
};

use super::{
    Message,
    consts::{RequestType, key, status},
};

/// A successful reply, correlated to its request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub sync: u64,
    pub schema_version: Option<u64>,
    pub request_type: Option<RequestType>,
    pub body: BTreeMap<u8, Value>,
}

/// Outcome of an SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlResult {
    /// A data-modifying statement.
    RowCount {
        count: u64,
        autoincrement_ids: Vec<Value>,
    },
    /// A query returning rows.
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub field_type: String,
}

impl Response {
    /// Splits an incoming frame into its sync id and either a response or
    /// the server error it reports.
    pub fn from_message(
        message: Message,
        request_type: Option<RequestType>,
    ) -> std::result::Result<(u64, Result<Response>), ConnectionError> {
        let sync = message
            .sync()
            .ok_or_else(|| ConnectionError::Protocol("response without sync id".into()))?;
        let code = message
            .code()
            .ok_or_else(|| ConnectionError::Protocol("response without status code".into()))?;

        if code == status::OK {
            let response = Response {
                sync,
                schema_version: message.schema_version(),
                request_type,
                body: message.body,
            };
            return Ok((sync, Ok(response)));
        }

        let error = server_error(code, &message.body);
        Ok((sync, Err(Error::Server(error))))
    }

    pub fn data(&self) -> Option<&Value> {
        self.body.get(&key::DATA)
    }

    /// The `DATA` payload, or nil when the reply carries none.
    pub fn into_data(mut self) -> Value {
        self.body.remove(&key::DATA).unwrap_or_default()
    }

    /// The `DATA` payload as a list of tuples.
    pub fn into_tuples(self) -> Result<Vec<Value>> {
        match self.into_data() {
            Value::Array(items) => Ok(items),
            Value::Nil => Ok(Vec::new()),
            other => Err(unexpected("array of tuples", &other)),
        }
    }

    /// Interprets the body as the reply to an SQL statement.
    ///
    /// `SQL_INFO` marks a row count, `METADATA` a row set.
    pub fn sql_result(&self) -> Result<SqlResult> {
        if let Some(info) = self.body.get(&key::SQL_INFO) {
            let entries = info.as_map().ok_or_else(|| unexpected("sql info map", info))?;
            let mut count = 0;
            let mut autoincrement_ids = Vec::new();
            for (k, v) in entries {
                match k.as_u64().and_then(|k| u8::try_from(k).ok()) {
                    Some(key::SQL_INFO_ROW_COUNT) => {
                        count = v.as_u64().ok_or_else(|| unexpected("row count", v))?;
                    }
                    Some(key::SQL_INFO_AUTOINCREMENT_IDS) => {
                        autoincrement_ids = v.as_array().map(<[Value]>::to_vec).unwrap_or_default();
                    }
                    _ => {}
                }
            }
            return Ok(SqlResult::RowCount {
                count,
                autoincrement_ids,
            });
        }

        if let Some(metadata) = self.body.get(&key::METADATA) {
            let columns = metadata
                .as_array()
                .ok_or_else(|| unexpected("metadata array", metadata))?
                .iter()
                .map(column)
                .collect::<Result<Vec<_>>>()?;
            let rows = match self.data() {
                Some(Value::Array(rows)) => rows
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .map(<[Value]>::to_vec)
                            .ok_or_else(|| unexpected("row array", row))
                    })
                    .collect::<Result<Vec<_>>>()?,
                Some(other) => return Err(unexpected("row set", other)),
                None => Vec::new(),
            };
            return Ok(SqlResult::Rows { columns, rows });
        }

        Err(Error::Codec(CodecError::UnexpectedType {
            expected: "sql info or metadata",
            found: "neither".into(),
        }))
    }
}

/// Builds the error for a nonzero status, preferring the plain message and
/// falling back to the first entry of the extended error stack.
fn server_error(code: u32, body: &BTreeMap<u8, Value>) -> ServerError {
    let code = code & !status::ERROR_FLAG;
    let message = body
        .get(&key::ERROR_24)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            let stack = body.get(&key::ERROR)?.as_map()?;
            let (_, frames) = stack.iter().find(|(k, _)| k.as_u64() == Some(0))?;
            let first = frames.as_array()?.first()?.as_map()?;
            first
                .iter()
                .find(|(k, _)| k.as_u64() == Some(3))
                .and_then(|(_, v)| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("server error {code}"));
    ServerError { code, message }
}

fn column(entry: &Value) -> Result<Column> {
    let fields = entry
        .as_map()
        .ok_or_else(|| unexpected("column metadata", entry))?;
    let lookup = |wanted: u8| {
        fields
            .iter()
            .find(|(k, _)| k.as_u64() == Some(u64::from(wanted)))
            .and_then(|(_, v)| v.as_str())
            .map(str::to_string)
    };
    Ok(Column {
        name: lookup(key::FIELD_NAME).ok_or_else(|| unexpected("column name", entry))?,
        field_type: lookup(key::FIELD_TYPE).unwrap_or_default(),
    })
}

fn unexpected(expected: &'static str, found: &Value) -> Error {
    Error::Codec(CodecError::UnexpectedType {
        expected,
        found: found.to_string(),
    })
}
