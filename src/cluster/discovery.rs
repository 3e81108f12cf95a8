use std::{
    collections::HashSet,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    Error, Result,
    codec::{CodecError, Value},
    engine::Engine,
    protocol::Request,
    supervisor::AddressSource,
};

/// Reports the current members of the cluster.
pub trait DiscoverySource: Send + Sync {
    fn current_members(&self) -> Result<HashSet<String>>;
}

/// Calls a stored function returning `host:port` strings.
///
/// Both a plain array and an array wrapped in a one-element result are
/// accepted.
#[derive(Debug, Clone)]
pub struct FunctionDiscovery {
    engine: Engine,
    function: String,
}

impl FunctionDiscovery {
    pub fn new(engine: Engine, function: impl Into<String>) -> Self {
        Self {
            engine,
            function: function.into(),
        }
    }
}

impl DiscoverySource for FunctionDiscovery {
    fn current_members(&self) -> Result<HashSet<String>> {
        let response = self
            .engine
            .execute(&Request::call(&self.function, Vec::new()))
            .wait()?;
        let data = response.into_tuples()?;
        let list = match data.as_slice() {
            [Value::Array(inner)] => inner.as_slice(),
            other => other,
        };
        list.iter()
            .map(|member| {
                member.as_str().map(str::to_string).ok_or_else(|| {
                    Error::from(CodecError::UnexpectedType {
                        expected: "host:port string",
                        found: member.to_string(),
                    })
                })
            })
            .collect()
    }
}

struct Stop {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background task polling a [`DiscoverySource`].
///
/// When the member list changes it is pushed into the address source; if the
/// connection in use points at a member that disappeared and nothing is in
/// flight, the connection is dropped so that the supervisor reconnects to a
/// valid member.
pub struct Discovery {
    stop: Arc<Stop>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Discovery {
    pub fn start(
        source: Arc<dyn DiscoverySource>,
        addresses: Arc<dyn AddressSource>,
        engine: Engine,
        delay: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(Stop {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread = thread::Builder::new()
            .name("tarn-discovery".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run(source.as_ref(), addresses.as_ref(), &engine, delay, &stop)
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        *self
            .stop
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.stop.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("discovery thread panicked");
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    source: &dyn DiscoverySource,
    addresses: &dyn AddressSource,
    engine: &Engine,
    delay: Duration,
    stop: &Stop,
) {
    let mut last: Option<HashSet<String>> = None;
    loop {
        {
            let stopped = stop.stopped.lock().unwrap_or_else(PoisonError::into_inner);
            let (stopped, _) = stop
                .wake
                .wait_timeout_while(stopped, delay, |stopped| !*stopped)
                .unwrap_or_else(PoisonError::into_inner);
            if *stopped {
                break;
            }
        }

        let members = match source.current_members() {
            Ok(members) => members,
            Err(e) => {
                debug!("discovery failed: {e}");
                continue;
            }
        };
        if last.as_ref() == Some(&members) {
            continue;
        }

        let mut list: Vec<String> = members.iter().cloned().collect();
        list.sort();
        addresses.refresh(list);

        if let Some(current) = engine.address() {
            if !members.contains(&current) && engine.pending_count() == 0 {
                info!("{current} left the cluster, reconnecting");
                engine.force_reconnect();
            }
        }
        last = Some(members);
    }
    debug!("discovery stopped");
}
