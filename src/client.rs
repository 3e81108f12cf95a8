//! The public entry point wiring engine, supervisor, schema and cluster parts.
use std::{marker::PhantomData, sync::Arc, time::Duration};

use log::{info, warn};

use crate::{
    Result,
    cluster::{Discovery, FunctionDiscovery, RetryCoordinator},
    codec::Value,
    config::ClientConfig,
    engine::{Engine, ResponseHandle},
    error::{ConnectionError, Error, TimeoutKind},
    protocol::{IndexRef, Request, Response, SpaceRef, consts::IteratorType},
    schema::SchemaCache,
    supervisor::{
        AddressSource, ConnectionState, RoundRobinAddresses, SingleAddress, StateCell, Supervisor,
    },
};

/// A connected client.
///
/// Fields drop in declaration order: discovery stops before the supervisor
/// closes the connection.
#[derive(Debug)]
pub struct Client {
    discovery: Option<Discovery>,
    retry: Option<RetryCoordinator>,
    schema: Arc<SchemaCache>,
    supervisor: Supervisor,
    engine: Engine,
}

impl Client {
    /// Connects, waits for the first live connection and loads the schema.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        if config.addresses.is_empty() {
            return Err(ConnectionError::Exhausted {
                attempts: 0,
                last: "no addresses configured".to_string(),
            }
            .into());
        }

        let engine = Engine::new(config.engine_config(), StateCell::new());
        let addresses: Arc<dyn AddressSource> =
            if config.addresses.len() == 1 && config.cluster.is_none() {
                Arc::new(SingleAddress(config.addresses[0].clone()))
            } else {
                Arc::new(RoundRobinAddresses::new(config.addresses.clone()))
            };
        let schema = SchemaCache::new(engine.clone(), config.schema_refresh_attempts);
        let retry = config.cluster.as_ref().map(|cluster| {
            RetryCoordinator::new(engine.clone(), Some(Arc::clone(&schema)), cluster.retry_threads)
        });

        let supervisor = Supervisor::start(
            engine.clone(),
            Arc::clone(&addresses),
            config.supervisor_config(),
        )?;

        let state = engine.state().wait_until(Some(config.init_timeout), |s| {
            matches!(s, ConnectionState::Alive | ConnectionState::Closed)
        });
        match state {
            ConnectionState::Alive => {}
            ConnectionState::Closed => {
                return Err(engine
                    .state()
                    .terminal_error()
                    .unwrap_or(ConnectionError::NotConnected.into()));
            }
            other => {
                warn!("no live connection after {:?}, last state {other}", config.init_timeout);
                let error = Error::Timeout(TimeoutKind::Init);
                supervisor.close(error.clone());
                return Err(error);
            }
        }

        schema.refresh()?;

        let discovery = match config
            .cluster
            .as_ref()
            .and_then(|c| c.discovery_function.as_ref().map(|f| (f, c.discovery_delay)))
        {
            Some((function, delay)) => Some(Discovery::start(
                Arc::new(FunctionDiscovery::new(engine.clone(), function.as_str())),
                addresses,
                engine.clone(),
                delay,
            )?),
            None => None,
        };

        info!(
            "connected to {}",
            engine.address().unwrap_or_else(|| "?".to_string())
        );
        Ok(Self {
            discovery,
            retry,
            schema,
            supervisor,
            engine,
        })
    }

    /// Submits `request` without waiting for its result.
    ///
    /// Requests naming spaces or indexes are bound to the schema cache, which
    /// is refreshed first if one of the spaces is not known yet. With a
    /// cluster configured, transient failures are retried until the
    /// operation timeout.
    pub fn execute(&self, request: Request) -> ResponseHandle {
        let request = if request.is_schema_bound() {
            if let Err(e) = self.schema.ensure_spaces(&request.space_names()) {
                return ResponseHandle::failed(e);
            }
            request.with_schema(Arc::clone(&self.schema))
        } else {
            request
        };
        match &self.retry {
            Some(retry) => retry.execute(Arc::new(request)),
            None => self.engine.execute(&request),
        }
    }

    /// Operations that block until their response arrives.
    pub fn sync_ops(&self) -> Ops<'_, Blocking> {
        Ops::new(self)
    }

    /// Operations returning a [`ResponseHandle`], which is also a `Future`.
    pub fn async_ops(&self) -> Ops<'_, Deferred> {
        Ops::new(self)
    }

    /// Operations whose results are discarded.
    pub fn fire_and_forget_ops(&self) -> Ops<'_, FireAndForget> {
        Ops::new(self)
    }

    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Operations parked for a replay; always zero without a cluster.
    pub fn parked_count(&self) -> usize {
        self.retry.as_ref().map_or(0, RetryCoordinator::parked_count)
    }

    /// Fails everything in flight and stops all background threads.
    /// Returns `false` if the client was already closed.
    pub fn close(&mut self) -> bool {
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop();
        }
        self.supervisor
            .close(ConnectionError::Closed("client closed".into()).into())
    }

    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        self.supervisor.await_termination(timeout)
    }
}

/// Decides what an [`Ops`] method returns.
pub trait Adapter {
    type Output;

    fn adapt(handle: ResponseHandle) -> Self::Output;
}

#[derive(Debug)]
pub enum Blocking {}

impl Adapter for Blocking {
    type Output = Result<Response>;

    fn adapt(handle: ResponseHandle) -> Self::Output {
        handle.wait()
    }
}

#[derive(Debug)]
pub enum Deferred {}

impl Adapter for Deferred {
    type Output = ResponseHandle;

    fn adapt(handle: ResponseHandle) -> Self::Output {
        handle
    }
}

#[derive(Debug)]
pub enum FireAndForget {}

impl Adapter for FireAndForget {
    /// The operation id, for logging.
    type Output = u64;

    fn adapt(handle: ResponseHandle) -> Self::Output {
        handle.id()
    }
}

/// Typed shortcuts over [`Client::execute`].
#[derive(Debug)]
pub struct Ops<'a, A: Adapter> {
    client: &'a Client,
    adapter: PhantomData<A>,
}

impl<'a, A: Adapter> Ops<'a, A> {
    fn new(client: &'a Client) -> Self {
        Self {
            client,
            adapter: PhantomData,
        }
    }

    fn run(&self, request: Request) -> A::Output {
        A::adapt(self.client.execute(request))
    }

    pub fn ping(&self) -> A::Output {
        self.run(Request::ping())
    }

    pub fn select(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
    ) -> A::Output {
        self.run(Request::select(space, index, key, offset, limit, iterator))
    }

    pub fn insert(&self, space: impl Into<SpaceRef>, tuple: Vec<Value>) -> A::Output {
        self.run(Request::insert(space, tuple))
    }

    pub fn replace(&self, space: impl Into<SpaceRef>, tuple: Vec<Value>) -> A::Output {
        self.run(Request::replace(space, tuple))
    }

    pub fn update(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> A::Output {
        self.run(Request::update(space, index, key, ops))
    }

    pub fn upsert(
        &self,
        space: impl Into<SpaceRef>,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    ) -> A::Output {
        self.run(Request::upsert(space, tuple, ops))
    }

    pub fn delete(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
    ) -> A::Output {
        self.run(Request::delete(space, index, key))
    }

    pub fn call(&self, function: &str, args: Vec<Value>) -> A::Output {
        self.run(Request::call(function, args))
    }

    pub fn eval(&self, expression: &str, args: Vec<Value>) -> A::Output {
        self.run(Request::eval(expression, args))
    }

    pub fn execute_sql(&self, sql: &str, binds: Vec<Value>) -> A::Output {
        self.run(Request::execute(sql, binds))
    }
}
