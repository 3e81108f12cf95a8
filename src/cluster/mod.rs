//! Retries for clients talking to a replicated cluster.
//!
//! The [`RetryCoordinator`] sits in front of the [`Engine`]. An operation
//! failing with a transient error is parked instead of being delivered, and
//! replayed when the connection next becomes alive. A request rejected for a
//! stale schema first waits for a schema refresh; if the connection is still
//! alive it is replayed as soon as that refresh completes.
mod discovery;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    Error, Result,
    engine::{Completion, Engine, ResponseHandle, ResultCell, Stage, Staged, Timer},
    error::{ConnectionError, TimeoutKind},
    protocol::{Response, ToWireMessage},
    schema::SchemaCache,
    supervisor::ConnectionState,
    thread::ThreadPool,
};

pub use discovery::{Discovery, DiscoverySource, FunctionDiscovery};

type SharedRequest = Arc<dyn ToWireMessage>;

struct Parked {
    staged: Staged<SharedRequest>,
    deadline: Option<Instant>,
    completion: Completion,
}

#[derive(Default)]
struct RetrySet {
    entries: HashMap<u64, Parked>,
    /// Set once the client closed; nothing is parked after that.
    closed: Option<Error>,
}

struct Inner {
    engine: Engine,
    schema: Option<Arc<SchemaCache>>,
    pool: ThreadPool,
    retries: Mutex<RetrySet>,
    next_entry: AtomicU64,
    timer: Timer,
}

/// Replays transiently failed operations. Clones share the same retry set.
#[derive(Clone)]
pub struct RetryCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("parked", &self.parked_count())
            .finish()
    }
}

impl RetryCoordinator {
    /// Subscribes to the engine's state so that parked operations are
    /// replayed on `Alive` and failed on `Closed`.
    pub fn new(engine: Engine, schema: Option<Arc<SchemaCache>>, threads: usize) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let timer = Timer::start(
                "tarn-retry-timer",
                Box::new(move |id| {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(id);
                    }
                }),
            );
            Inner {
                engine,
                schema,
                pool: ThreadPool::new("tarn-retry", threads),
                retries: Mutex::new(RetrySet::default()),
                next_entry: AtomicU64::new(1),
                timer,
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.engine.state().subscribe(Arc::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                ConnectionState::Alive => inner.schedule_replay(),
                ConnectionState::Closed => inner.fail_all(),
                _ => {}
            }
        }));

        Self { inner }
    }

    pub fn execute(&self, request: SharedRequest) -> ResponseHandle {
        self.execute_with_timeout(request, self.inner.engine.config().operation_timeout)
    }

    /// Like [`Engine::execute_with_timeout`], except that `timeout` bounds
    /// the operation across all of its replays.
    pub fn execute_with_timeout(
        &self,
        request: SharedRequest,
        timeout: Option<Duration>,
    ) -> ResponseHandle {
        let id = self.inner.next_entry.fetch_add(1, Ordering::Relaxed);
        let deadline = timeout.map(|t| Instant::now() + t);
        let cell = ResultCell::new();
        self.inner
            .submit(id, Staged::ready(request), deadline, cell.completion());
        ResponseHandle::new(id, cell)
    }

    /// Operations waiting for a replay.
    pub fn parked_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RetrySet> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(
        self: &Arc<Self>,
        id: u64,
        mut staged: Staged<SharedRequest>,
        deadline: Option<Instant>,
        completion: Completion,
    ) {
        let remaining = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => Some(remaining),
                _ => {
                    completion(Err(Error::Timeout(TimeoutKind::Operation)));
                    return;
                }
            },
            None => None,
        };
        let Some(request) = staged.send().map(Arc::clone) else {
            warn!("retry entry {id} submitted in stage {:?}", staged.stage());
            return;
        };

        let inner = Arc::clone(self);
        self.engine.submit(
            request.as_ref(),
            remaining,
            Box::new(move |result| inner.on_result(id, staged, deadline, completion, result)),
        );
    }

    fn on_result(
        self: &Arc<Self>,
        id: u64,
        mut staged: Staged<SharedRequest>,
        deadline: Option<Instant>,
        completion: Completion,
        result: Result<Response>,
    ) {
        let error = match result {
            Err(e) if e.is_transient() => e,
            other => {
                completion(other);
                return;
            }
        };

        let stale_schema = self.schema.is_some()
            && matches!(&error, Error::Server(e) if e.is_wrong_schema_version());
        staged.rearm(stale_schema);

        {
            let mut retries = self.lock();
            if let Some(reason) = &retries.closed {
                let reason = reason.clone();
                drop(retries);
                completion(Err(reason));
                return;
            }
            debug!("parking operation {id} after transient error: {error}");
            retries.entries.insert(
                id,
                Parked {
                    staged,
                    deadline,
                    completion,
                },
            );
        }
        if let Some(deadline) = deadline {
            self.timer.schedule(id, deadline);
        }

        // a schema mismatch does not wait for a reconnect, and a connection
        // error may have raced with the connection coming back
        let alive = self.engine.state().get().is_alive();
        if alive && (stale_schema || matches!(error, Error::Connection(_))) {
            self.schedule_replay();
        }
    }

    fn schedule_replay(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        if !self.pool.execute(move || inner.replay_all()) {
            warn!("retry pool unavailable, replays postponed");
        }
    }

    /// Refreshes the schema if any parked operation needs it, then resubmits
    /// every ready operation.
    fn replay_all(self: &Arc<Self>) {
        let needs_preflight = self
            .lock()
            .entries
            .values()
            .any(|p| p.staged.stage() == Stage::WaitingOnPreflight);
        if needs_preflight {
            if let Some(schema) = &self.schema {
                match schema.refresh() {
                    Ok(version) => debug!("preflight schema refresh to version {version}"),
                    Err(e) => {
                        warn!("preflight schema refresh failed: {e}");
                        if !e.is_transient() {
                            self.fail_waiting(e);
                        }
                        return;
                    }
                }
            }
            for parked in self.lock().entries.values_mut() {
                parked.staged.preflight_done();
            }
        }

        let ready: Vec<(u64, Parked)> = {
            let mut retries = self.lock();
            let ids: Vec<u64> = retries
                .entries
                .iter()
                .filter(|(_, p)| p.staged.stage() == Stage::Ready)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| retries.entries.remove(&id).map(|p| (id, p)))
                .collect()
        };
        if !ready.is_empty() {
            info!("replaying {} parked operations", ready.len());
        }
        for (id, parked) in ready {
            if let Some(deadline) = parked.deadline {
                self.timer.cancel(id, deadline);
            }
            self.submit(id, parked.staged, parked.deadline, parked.completion);
        }
    }

    /// Fails operations blocked on a preflight that cannot succeed.
    fn fail_waiting(&self, error: Error) {
        let waiting: Vec<Parked> = {
            let mut retries = self.lock();
            let ids: Vec<u64> = retries
                .entries
                .iter()
                .filter(|(_, p)| p.staged.stage() == Stage::WaitingOnPreflight)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| retries.entries.remove(id))
                .collect()
        };
        for parked in waiting {
            (parked.completion)(Err(error.clone()));
        }
    }

    fn expire(&self, id: u64) {
        let parked = self.lock().entries.remove(&id);
        if let Some(parked) = parked {
            debug!("parked operation {id} timed out");
            (parked.completion)(Err(Error::Timeout(TimeoutKind::Operation)));
        }
    }

    fn fail_all(&self) {
        let reason = self
            .engine
            .state()
            .terminal_error()
            .unwrap_or_else(|| ConnectionError::Closed("client closed".into()).into());
        let parked: Vec<Parked> = {
            let mut retries = self.lock();
            retries.closed = Some(reason.clone());
            retries.entries.drain().map(|(_, p)| p).collect()
        };
        if !parked.is_empty() {
            info!("failing {} parked operations: {reason}", parked.len());
        }
        for p in parked {
            (p.completion)(Err(reason.clone()));
        }
        self.timer.stop();
    }
}
