use std::{collections::HashMap, sync::Arc};

use crate::{Error, codec::CodecError, codec::Value};

use super::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPart {
    pub field: u32,
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub id: u32,
    pub name: String,
    /// `TREE`, `HASH`, ...
    pub kind: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceMeta {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub fields: Vec<FieldMeta>,
    /// Ordered by index id.
    pub indexes: Vec<IndexMeta>,
}

impl SpaceMeta {
    pub fn index(&self, name: &str) -> Result<&IndexMeta, SchemaError> {
        self.indexes
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| SchemaError::IndexNotFound {
                space: self.name.clone(),
                index: name.to_string(),
            })
    }

    pub fn index_by_id(&self, id: u32) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// Position of a field in the tuple format.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// An immutable view of the catalog at one schema version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    pub version: u64,
    spaces: HashMap<String, Arc<SpaceMeta>>,
    by_id: HashMap<u32, String>,
}

impl SchemaSnapshot {
    pub fn space(&self, name: &str) -> Result<&Arc<SpaceMeta>, SchemaError> {
        self.spaces
            .get(name)
            .ok_or_else(|| SchemaError::SpaceNotFound(name.to_string()))
    }

    pub fn space_by_id(&self, id: u32) -> Result<&Arc<SpaceMeta>, SchemaError> {
        self.by_id
            .get(&id)
            .and_then(|name| self.spaces.get(name))
            .ok_or_else(|| SchemaError::SpaceNotFound(format!("#{id}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.spaces.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn space_names(&self) -> impl Iterator<Item = &str> {
        self.spaces.keys().map(String::as_str)
    }

    /// Joins `_vspace` and `_vindex` rows into a snapshot.
    pub(crate) fn build(version: u64, spaces: &[Value], indexes: &[Value]) -> Result<Self, Error> {
        let mut by_space: HashMap<u32, Vec<IndexMeta>> = HashMap::new();
        for tuple in indexes {
            let (space_id, index) = parse_index(tuple)?;
            by_space.entry(space_id).or_default().push(index);
        }

        let mut snapshot = SchemaSnapshot {
            version,
            ..Default::default()
        };
        for tuple in spaces {
            let mut space = parse_space(tuple)?;
            let mut indexes = by_space.remove(&space.id).unwrap_or_default();
            indexes.sort_by_key(|i| i.id);
            space.indexes = indexes;

            snapshot.by_id.insert(space.id, space.name.clone());
            snapshot.spaces.insert(space.name.clone(), Arc::new(space));
        }
        Ok(snapshot)
    }
}

fn unexpected(expected: &'static str, found: &Value) -> Error {
    Error::Codec(CodecError::UnexpectedType {
        expected,
        found: found.to_string(),
    })
}

fn field<'a>(tuple: &'a [Value], i: usize, whole: &Value) -> Result<&'a Value, Error> {
    tuple.get(i).ok_or_else(|| unexpected("longer catalog tuple", whole))
}

fn id_at(tuple: &[Value], i: usize, whole: &Value) -> Result<u32, Error> {
    let value = field(tuple, i, whole)?;
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| unexpected("catalog id", value))
}

fn str_at(tuple: &[Value], i: usize, whole: &Value) -> Result<String, Error> {
    let value = field(tuple, i, whole)?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| unexpected("catalog name", value))
}

/// `[id, owner, name, engine, field_count, flags, format]`
fn parse_space(tuple: &Value) -> Result<SpaceMeta, Error> {
    let fields = tuple
        .as_array()
        .ok_or_else(|| unexpected("space tuple", tuple))?;

    let format = match fields.get(6) {
        Some(Value::Array(format)) => format
            .iter()
            .map(|f| FieldMeta {
                name: f.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                field_type: f.get("type").and_then(Value::as_str).unwrap_or("any").to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(SpaceMeta {
        id: id_at(fields, 0, tuple)?,
        name: str_at(fields, 2, tuple)?,
        engine: str_at(fields, 3, tuple)?,
        fields: format,
        indexes: Vec::new(),
    })
}

/// `[space_id, index_id, name, type, opts, parts]`
fn parse_index(tuple: &Value) -> Result<(u32, IndexMeta), Error> {
    let fields = tuple
        .as_array()
        .ok_or_else(|| unexpected("index tuple", tuple))?;

    let unique = fields
        .get(4)
        .and_then(|opts| opts.get("unique"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let parts = match fields.get(5) {
        Some(Value::Array(parts)) => parts
            .iter()
            .map(parse_part)
            .collect::<Result<Vec<_>, Error>>()?,
        _ => Vec::new(),
    };

    let index = IndexMeta {
        id: id_at(fields, 1, tuple)?,
        name: str_at(fields, 2, tuple)?,
        kind: str_at(fields, 3, tuple)?,
        unique,
        parts,
    };
    Ok((id_at(fields, 0, tuple)?, index))
}

/// Accepts both `{field = n, type = t}` and the older `[n, t]`.
fn parse_part(part: &Value) -> Result<IndexPart, Error> {
    let (field, field_type) = match part {
        Value::Map(_) => (part.get("field"), part.get("type")),
        Value::Array(items) => (items.first(), items.get(1)),
        other => return Err(unexpected("index part", other)),
    };
    let field = field
        .and_then(Value::as_u64)
        .and_then(|f| u32::try_from(f).ok())
        .ok_or_else(|| unexpected("index part field number", part))?;
    Ok(IndexPart {
        field,
        field_type: field_type
            .and_then(Value::as_str)
            .unwrap_or("any")
            .to_string(),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::codec::Value;

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::from(*k), v.clone()))
                .collect(),
        )
    }

    pub fn space_tuple(id: u32, name: &str, fields: &[(&str, &str)]) -> Value {
        let format = fields
            .iter()
            .map(|(n, t)| map(&[("name", Value::from(*n)), ("type", Value::from(*t))]))
            .collect::<Vec<_>>();
        Value::Array(vec![
            Value::from(id),
            Value::from(1),
            Value::from(name),
            Value::from("memtx"),
            Value::from(0),
            Value::Map(Vec::new()),
            Value::Array(format),
        ])
    }

    pub fn index_tuple(space: u32, id: u32, name: &str, unique: bool, parts: Value) -> Value {
        Value::Array(vec![
            Value::from(space),
            Value::from(id),
            Value::from(name),
            Value::from("tree"),
            map(&[("unique", Value::from(unique))]),
            parts,
        ])
    }

    pub fn map_parts(parts: &[(u32, &str)]) -> Value {
        Value::Array(
            parts
                .iter()
                .map(|(f, t)| map(&[("field", Value::from(*f)), ("type", Value::from(*t))]))
                .collect(),
        )
    }

    pub fn array_parts(parts: &[(u32, &str)]) -> Value {
        Value::Array(
            parts
                .iter()
                .map(|(f, t)| Value::Array(vec![Value::from(*f), Value::from(*t)]))
                .collect(),
        )
    }
}
