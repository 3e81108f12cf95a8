use std::{fmt, sync::Arc};

use crate::{
    Result,
    codec::Value,
    schema::{SchemaCache, SchemaError},
};

use super::{
    Message,
    consts::{IteratorType, RequestType, key},
};

/// Anything the engine can put on the wire.
///
/// The engine calls [`to_wire_message`](ToWireMessage::to_wire_message) at
/// the moment the request enters the write path, passing the schema version
/// most recently reported by the server, and adds the sync id itself.
pub trait ToWireMessage: Send + Sync + fmt::Debug {
    fn request_type(&self) -> RequestType;

    fn to_wire_message(&self, schema_version: u64) -> Result<Message>;
}

/// A space addressed by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

impl From<u32> for SpaceRef {
    fn from(value: u32) -> Self {
        SpaceRef::Id(value)
    }
}

impl From<&str> for SpaceRef {
    fn from(value: &str) -> Self {
        SpaceRef::Name(value.to_string())
    }
}

impl From<String> for SpaceRef {
    fn from(value: String) -> Self {
        SpaceRef::Name(value)
    }
}

/// An index addressed by id or by name within its space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

impl From<u32> for IndexRef {
    fn from(value: u32) -> Self {
        IndexRef::Id(value)
    }
}

impl From<&str> for IndexRef {
    fn from(value: &str) -> Self {
        IndexRef::Name(value.to_string())
    }
}

impl From<String> for IndexRef {
    fn from(value: String) -> Self {
        IndexRef::Name(value)
    }
}

/// A body argument, either concrete or resolved through the schema at encode time.
#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Value(Value),
    Space(String),
    Index { space: SpaceRef, index: String },
}

/// A logical request: an opcode plus ordered body arguments.
#[derive(Clone)]
pub struct Request {
    request_type: RequestType,
    args: Vec<(u8, Arg)>,
    schema: Option<Arc<SchemaCache>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_type", &self.request_type)
            .field("args", &self.args)
            .finish()
    }
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            args: Vec::new(),
            schema: None,
        }
    }

    pub fn arg(mut self, key: u8, value: impl Into<Value>) -> Self {
        self.args.push((key, Arg::Value(value.into())));
        self
    }

    fn space(mut self, space: SpaceRef) -> Self {
        let arg = match space {
            SpaceRef::Id(id) => Arg::Value(Value::from(id)),
            SpaceRef::Name(name) => Arg::Space(name),
        };
        self.args.push((key::SPACE_ID, arg));
        self
    }

    fn index(mut self, space: &SpaceRef, index: IndexRef) -> Self {
        let arg = match index {
            IndexRef::Id(id) => Arg::Value(Value::from(id)),
            IndexRef::Name(index) => Arg::Index {
                space: space.clone(),
                index,
            },
        };
        self.args.push((key::INDEX_ID, arg));
        self
    }

    /// Attaches the cache used to resolve space and index names.
    pub fn with_schema(mut self, schema: Arc<SchemaCache>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Whether encoding depends on the schema snapshot.
    pub fn is_schema_bound(&self) -> bool {
        self.args
            .iter()
            .any(|(_, arg)| !matches!(arg, Arg::Value(_)))
    }

    /// Space names this request needs resolved.
    pub fn space_names(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|(_, arg)| match arg {
                Arg::Space(name) => Some(name.as_str()),
                Arg::Index {
                    space: SpaceRef::Name(name),
                    ..
                } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn ping() -> Self {
        Self::new(RequestType::Ping)
    }

    pub fn select(
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
    ) -> Self {
        let space = space.into();
        Self::new(RequestType::Select)
            .space(space.clone())
            .index(&space, index.into())
            .arg(key::KEY, key)
            .arg(key::OFFSET, offset)
            .arg(key::LIMIT, limit)
            .arg(key::ITERATOR, iterator.code())
    }

    pub fn insert(space: impl Into<SpaceRef>, tuple: Vec<Value>) -> Self {
        Self::new(RequestType::Insert)
            .space(space.into())
            .arg(key::TUPLE, tuple)
    }

    pub fn replace(space: impl Into<SpaceRef>, tuple: Vec<Value>) -> Self {
        Self::new(RequestType::Replace)
            .space(space.into())
            .arg(key::TUPLE, tuple)
    }

    pub fn update(
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> Self {
        let space = space.into();
        Self::new(RequestType::Update)
            .space(space.clone())
            .index(&space, index.into())
            .arg(key::KEY, key)
            .arg(key::TUPLE, ops)
    }

    pub fn upsert(space: impl Into<SpaceRef>, tuple: Vec<Value>, ops: Vec<Value>) -> Self {
        Self::new(RequestType::Upsert)
            .space(space.into())
            .arg(key::TUPLE, tuple)
            .arg(key::OPS, ops)
    }

    pub fn delete(
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
    ) -> Self {
        let space = space.into();
        Self::new(RequestType::Delete)
            .space(space.clone())
            .index(&space, index.into())
            .arg(key::KEY, key)
    }

    pub fn call(function: &str, args: Vec<Value>) -> Self {
        Self::new(RequestType::Call)
            .arg(key::FUNCTION_NAME, function)
            .arg(key::TUPLE, args)
    }

    /// Legacy call whose results are always wrapped into tuples.
    pub fn call16(function: &str, args: Vec<Value>) -> Self {
        Self::new(RequestType::Call16)
            .arg(key::FUNCTION_NAME, function)
            .arg(key::TUPLE, args)
    }

    pub fn eval(expression: &str, args: Vec<Value>) -> Self {
        Self::new(RequestType::Eval)
            .arg(key::EXPR, expression)
            .arg(key::TUPLE, args)
    }

    pub fn execute(sql: &str, binds: Vec<Value>) -> Self {
        Self::new(RequestType::Execute)
            .arg(key::SQL_TEXT, sql)
            .arg(key::SQL_BIND, binds)
    }

    pub fn execute_prepared(statement_id: u64, binds: Vec<Value>) -> Self {
        Self::new(RequestType::Execute)
            .arg(key::STMT_ID, statement_id)
            .arg(key::SQL_BIND, binds)
    }

    pub fn prepare(sql: &str) -> Self {
        Self::new(RequestType::Prepare).arg(key::SQL_TEXT, sql)
    }

    pub fn auth(user: &str, mechanism: &str, scramble: &[u8]) -> Self {
        Self::new(RequestType::Auth).arg(key::USER_NAME, user).arg(
            key::TUPLE,
            vec![Value::from(mechanism), Value::Binary(scramble.to_vec())],
        )
    }
}

impl ToWireMessage for Request {
    fn request_type(&self) -> RequestType {
        self.request_type
    }

    fn to_wire_message(&self, _schema_version: u64) -> Result<Message> {
        let mut message = Message::new().with_header(key::CODE, self.request_type.code());
        if !self.is_schema_bound() {
            for (k, arg) in &self.args {
                if let Arg::Value(v) = arg {
                    message.body.insert(*k, v.clone());
                }
            }
            return Ok(message);
        }

        let schema = self.schema.as_ref().ok_or(SchemaError::Unavailable)?;
        let snapshot = schema.snapshot();
        for (k, arg) in &self.args {
            let value = match arg {
                Arg::Value(v) => v.clone(),
                Arg::Space(name) => Value::from(snapshot.space(name)?.id),
                Arg::Index { space, index } => {
                    let space = match space {
                        SpaceRef::Id(id) => snapshot.space_by_id(*id)?,
                        SpaceRef::Name(name) => snapshot.space(name)?,
                    };
                    Value::from(space.index(index)?.id)
                }
            };
            message.body.insert(*k, value);
        }
        // the server rejects the request if its catalog moved past this snapshot
        message
            .header
            .insert(key::SCHEMA_VERSION, Value::from(snapshot.version));
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_select_needs_no_schema() {
        let request = Request::select(512_u32, 0_u32, vec![Value::from(1)], 0, 10, IteratorType::Eq);
        assert!(!request.is_schema_bound());

        let message = request.to_wire_message(0).unwrap();
        assert_eq!(message.code(), Some(1));
        assert_eq!(message.body.get(&key::SPACE_ID), Some(&Value::from(512)));
        assert_eq!(message.body.get(&key::LIMIT), Some(&Value::from(10)));
        assert!(message.schema_version().is_none());
    }

    #[test]
    fn named_space_without_cache_fails() {
        let request = Request::insert("users", vec![Value::from(1)]);
        assert!(request.is_schema_bound());
        assert_eq!(request.space_names(), vec!["users"]);
        assert!(matches!(
            request.to_wire_message(0),
            Err(crate::Error::Schema(SchemaError::Unavailable))
        ));
    }

    #[test]
    fn call_and_eval_bodies() {
        let message = Request::call("box.info", vec![])
            .to_wire_message(0)
            .unwrap();
        assert_eq!(message.code(), Some(10));
        assert_eq!(
            message.body.get(&key::FUNCTION_NAME),
            Some(&Value::from("box.info"))
        );

        let message = Request::eval("return ...", vec![Value::from(42)])
            .to_wire_message(0)
            .unwrap();
        assert_eq!(message.code(), Some(8));
        assert_eq!(
            message.body.get(&key::TUPLE),
            Some(&Value::Array(vec![Value::from(42)]))
        );
    }

    #[test]
    fn auth_carries_mechanism_and_scramble() {
        let message = Request::auth("guest", "chap-sha1", &[1, 2, 3])
            .to_wire_message(0)
            .unwrap();
        assert_eq!(
            message.body.get(&key::TUPLE),
            Some(&Value::Array(vec![
                Value::from("chap-sha1"),
                Value::Binary(vec![1, 2, 3])
            ]))
        );
    }
}
