//! Cached catalog metadata.
//!
//! The [`SchemaCache`] reads the `_vspace` and `_vindex` system views
//! through the engine and keeps the joined result as one immutable
//! [`SchemaSnapshot`]. The two views are read independently, so a refresh
//! repeats both reads until the server reports the same schema version for
//! each. Readers never block on a refresh; they see either the previous or
//! the new snapshot.
mod meta;

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};
use thiserror::Error;

use crate::{
    Result,
    engine::Engine,
    protocol::{
        Request, Response,
        consts::{IteratorType, space},
    },
};

pub use meta::{FieldMeta, IndexMeta, IndexPart, SchemaSnapshot, SpaceMeta};

#[cfg(test)]
pub(crate) use meta::fixtures;

pub const DEFAULT_REFRESH_ATTEMPTS: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("no schema cache attached to request")]
    Unavailable,

    #[error("space '{0}' not found")]
    SpaceNotFound(String),

    #[error("index '{index}' not found in space '{space}'")]
    IndexNotFound { space: String, index: String },

    #[error("catalog versions still differ after {attempts} attempts")]
    Inconsistent { attempts: u32 },
}

pub struct SchemaCache {
    engine: Engine,
    max_attempts: u32,
    current: RwLock<Arc<SchemaSnapshot>>,
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("version", &self.version())
            .finish()
    }
}

impl SchemaCache {
    pub fn new(engine: Engine, max_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            engine,
            max_attempts: max_attempts.max(1),
            current: RwLock::new(Arc::new(SchemaSnapshot::default())),
        })
    }

    /// Reloads the catalog and returns the version now cached.
    ///
    /// A snapshot older than the cached one is discarded, so the returned
    /// version never goes backwards.
    pub fn refresh(&self) -> Result<u64> {
        for attempt in 1..=self.max_attempts {
            let spaces = self.read_catalog(space::VSPACE)?;
            let indexes = self.read_catalog(space::VINDEX)?;

            let (spaces_version, indexes_version) = (
                spaces.schema_version.unwrap_or_default(),
                indexes.schema_version.unwrap_or_default(),
            );
            if spaces_version != indexes_version {
                debug!(
                    "catalog changed between reads ({spaces_version} vs {indexes_version}), attempt {attempt}"
                );
                continue;
            }

            let snapshot =
                SchemaSnapshot::build(spaces_version, &spaces.into_tuples()?, &indexes.into_tuples()?)?;
            return Ok(self.install(snapshot));
        }
        Err(SchemaError::Inconsistent {
            attempts: self.max_attempts,
        }
        .into())
    }

    fn read_catalog(&self, catalog: u32) -> Result<Response> {
        let request = Request::select(
            catalog,
            space::PRIMARY,
            Vec::new(),
            0,
            u32::MAX,
            IteratorType::All,
        );
        self.engine.execute(&request).wait()
    }

    fn install(&self, snapshot: SchemaSnapshot) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if snapshot.version >= current.version {
            info!(
                "schema version {} loaded with {} spaces",
                snapshot.version,
                snapshot.len()
            );
            *current = Arc::new(snapshot);
        } else {
            debug!(
                "discarding schema version {}, already at {}",
                snapshot.version, current.version
            );
        }
        current.version
    }

    /// The current snapshot. Holding it does not block refreshes.
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub fn space(&self, name: &str) -> Result<Arc<SpaceMeta>> {
        Ok(Arc::clone(self.snapshot().space(name)?))
    }

    pub fn space_by_id(&self, id: u32) -> Result<Arc<SpaceMeta>> {
        Ok(Arc::clone(self.snapshot().space_by_id(id)?))
    }

    pub fn space_index(&self, space: &str, index: &str) -> Result<IndexMeta> {
        Ok(self.snapshot().space(space)?.index(index)?.clone())
    }

    /// Refreshes once if any of `names` is unknown, then fails with
    /// [`SchemaError::SpaceNotFound`] for the first name still missing.
    pub fn ensure_spaces(&self, names: &[&str]) -> Result<()> {
        let snapshot = self.snapshot();
        if names.iter().all(|name| snapshot.contains(name)) {
            return Ok(());
        }
        self.refresh()?;
        let snapshot = self.snapshot();
        for name in names {
            snapshot.space(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        thread,
    };

    use super::{fixtures::*, *};
    use crate::{
        Error,
        codec::Value,
        engine::EngineConfig,
        protocol::{Message, ToWireMessage, consts::key},
        testing::{MockServer, Reply, attached_engine},
    };

    fn catalog_id(request: &Message) -> Option<u64> {
        request.body.get(&key::SPACE_ID).and_then(Value::as_u64)
    }

    fn my_space_catalog() -> (Vec<Value>, Vec<Value>) {
        (
            vec![space_tuple(280, "my_space", &[("id", "unsigned"), ("name", "string")])],
            vec![index_tuple(280, 0, "primary", true, map_parts(&[(0, "unsigned")]))],
        )
    }

    /// Serves the catalog with versions chosen per read by `versions`.
    fn catalog_server<F>(versions: F) -> MockServer
    where
        F: Fn(u32) -> u64 + Send + Sync + 'static,
    {
        let (spaces, indexes) = my_space_catalog();
        MockServer::start(move |request| match catalog_id(request) {
            Some(id) if id == u64::from(space::VSPACE) => {
                Reply::ok(spaces.clone()).with_schema_version(versions(space::VSPACE))
            }
            Some(id) if id == u64::from(space::VINDEX) => {
                Reply::ok(indexes.clone()).with_schema_version(versions(space::VINDEX))
            }
            _ => Reply::error(36, "unknown space"),
        })
    }

    #[test]
    fn unknown_space_is_loaded_on_demand() {
        let server = catalog_server(|_| 7);
        let engine = attached_engine(&server, EngineConfig::default());
        let cache = SchemaCache::new(engine, DEFAULT_REFRESH_ATTEMPTS);
        assert!(cache.snapshot().is_empty());

        cache.ensure_spaces(&["my_space"]).unwrap();
        assert_eq!(cache.version(), 7);
        assert_eq!(cache.space("my_space").unwrap().id, 280);
        assert_eq!(cache.space_index("my_space", "primary").unwrap().id, 0);
        assert_eq!(cache.space_by_id(280).unwrap().name, "my_space");
        assert_eq!(server.request_count(), 2);

        // cached now, no more catalog reads
        cache.ensure_spaces(&["my_space"]).unwrap();
        assert_eq!(server.request_count(), 2);

        assert!(matches!(
            cache.ensure_spaces(&["other"]),
            Err(Error::Schema(SchemaError::SpaceNotFound(name))) if name == "other"
        ));
        assert!(matches!(
            cache.space_index("my_space", "secondary"),
            Err(Error::Schema(SchemaError::IndexNotFound { .. }))
        ));
    }

    #[test]
    fn named_request_resolves_against_snapshot() {
        let server = catalog_server(|_| 7);
        let engine = attached_engine(&server, EngineConfig::default());
        let cache = SchemaCache::new(engine, DEFAULT_REFRESH_ATTEMPTS);
        cache.refresh().unwrap();

        let request = Request::select(
            "my_space",
            "primary",
            vec![Value::from(1)],
            0,
            1,
            IteratorType::Eq,
        )
        .with_schema(Arc::clone(&cache));
        let message = request.to_wire_message(0).unwrap();
        assert_eq!(message.body.get(&key::SPACE_ID), Some(&Value::from(280)));
        assert_eq!(message.body.get(&key::INDEX_ID), Some(&Value::from(0)));
        assert_eq!(message.schema_version(), Some(7));
    }

    #[test]
    fn rereads_until_versions_match() {
        // the index view runs one version ahead on the first round
        let reads = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reads);
        let server = catalog_server(move |catalog| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if catalog == space::VINDEX && n < 2 { 8 } else { 8.min(7 + n) }
        });
        let engine = attached_engine(&server, EngineConfig::default());
        let cache = SchemaCache::new(engine, DEFAULT_REFRESH_ATTEMPTS);

        assert_eq!(cache.refresh().unwrap(), 8);
        assert_eq!(reads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn gives_up_when_catalog_keeps_moving() {
        let server = catalog_server(|catalog| if catalog == space::VSPACE { 1 } else { 2 });
        let engine = attached_engine(&server, EngineConfig::default());
        let cache = SchemaCache::new(engine, 3);
        assert!(matches!(
            cache.refresh(),
            Err(Error::Schema(SchemaError::Inconsistent { attempts: 3 }))
        ));
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn version_never_goes_backwards() {
        // every pair of reads sees a newer version than the previous pair
        let version = Arc::new(AtomicU64::new(0));
        let bump = Arc::clone(&version);
        let server = catalog_server(move |catalog| {
            if catalog == space::VSPACE {
                bump.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                bump.load(Ordering::SeqCst)
            }
        });
        let engine = attached_engine(&server, EngineConfig::default());
        let cache = SchemaCache::new(engine, 100);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut seen = 0;
                    for _ in 0..10 {
                        if let Ok(v) = cache.refresh() {
                            assert!(v >= seen, "version went from {seen} to {v}");
                            seen = v;
                        }
                        assert!(cache.version() >= seen);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // a stale snapshot is discarded
        let current = cache.version();
        assert_eq!(cache.install(SchemaSnapshot::default()), current);
    }
}
