use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, PoisonError},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use crate::{
    Error, Result,
    error::ConnectionError,
    protocol::{Response, consts::RequestType},
};

/// Receives the single outcome of an operation.
pub type Completion = Box<dyn FnOnce(Result<Response>) + Send + Sync + 'static>;

/// An operation registered in the correlation table.
pub(crate) struct PendingOperation {
    pub request_type: RequestType,
    pub deadline: Option<Instant>,
    pub created_schema_version: u64,
    pub completion: Completion,
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("request_type", &self.request_type)
            .field("deadline", &self.deadline)
            .field("created_schema_version", &self.created_schema_version)
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    result: Option<Result<Response>>,
    done: bool,
    taken: bool,
    waker: Option<Waker>,
}

/// One-shot cell shared by a completer and a [`ResponseHandle`].
#[derive(Default)]
pub(crate) struct ResultCell {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl ResultCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores the result. Only the first call has any effect.
    pub fn complete(&self, result: Result<Response>) -> bool {
        let waker = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.done {
                return false;
            }
            slot.done = true;
            slot.result = Some(result);
            slot.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// A completion that fills this cell.
    pub fn completion(self: &Arc<Self>) -> Completion {
        let cell = Arc::clone(self);
        Box::new(move |result| {
            cell.complete(result);
        })
    }
}

/// Caller's side of an operation.
///
/// Blocking callers use [`wait`](Self::wait); async callers `.await` the
/// handle; fire-and-forget callers simply drop it.
pub struct ResponseHandle {
    id: u64,
    cell: Arc<ResultCell>,
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl ResponseHandle {
    pub(crate) fn new(id: u64, cell: Arc<ResultCell>) -> Self {
        Self { id, cell }
    }

    /// A handle that is already completed with `error`.
    pub(crate) fn failed(error: Error) -> Self {
        let cell = ResultCell::new();
        cell.complete(Err(error));
        Self::new(0, cell)
    }

    /// Sync id of an engine submission, or the retry entry id of a
    /// coordinated one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.cell
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .done
    }

    /// Blocks until the operation completes.
    pub fn wait(self) -> Result<Response> {
        let mut slot = self.cell.slot.lock().unwrap_or_else(PoisonError::into_inner);
        while !slot.done {
            slot = self
                .cell
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        take(&mut slot)
    }

    /// Blocks for at most `timeout`; `None` if the operation is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Response>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.cell.slot.lock().unwrap_or_else(PoisonError::into_inner);
        while !slot.done {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .cell
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(take(&mut slot))
    }

    /// Takes the result if the operation already completed.
    pub fn try_result(&self) -> Option<Result<Response>> {
        let mut slot = self.cell.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.done { Some(take(&mut slot)) } else { None }
    }
}

fn take(slot: &mut Slot) -> Result<Response> {
    if slot.taken {
        return Err(Error::Connection(ConnectionError::Protocol(
            "result already taken".into(),
        )));
    }
    slot.taken = true;
    slot.result
        .take()
        .unwrap_or_else(|| Err(Error::Connection(ConnectionError::NotConnected)))
}

impl Future for ResponseHandle {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.cell.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.done {
            return Poll::Ready(take(&mut slot));
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, thread};

    use super::*;
    use crate::error::TimeoutKind;

    fn response(sync: u64) -> Response {
        Response {
            sync,
            schema_version: None,
            request_type: Some(RequestType::Ping),
            body: BTreeMap::new(),
        }
    }

    #[test]
    fn first_completion_wins() {
        let cell = ResultCell::new();
        assert!(cell.complete(Ok(response(1))));
        assert!(!cell.complete(Err(Error::Timeout(TimeoutKind::Operation))));

        let handle = ResponseHandle::new(1, cell);
        assert_eq!(handle.wait().unwrap().sync, 1);
    }

    #[test]
    fn wait_blocks_until_completed() {
        let cell = ResultCell::new();
        let handle = ResponseHandle::new(4, Arc::clone(&cell));
        let completer = cell.completion();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer(Ok(response(4)));
        });
        assert_eq!(handle.wait().unwrap().sync, 4);
    }

    #[test]
    fn wait_timeout_reports_still_running() {
        let handle = ResponseHandle::new(2, ResultCell::new());
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(handle.try_result().is_none());
        assert!(!handle.is_done());
    }

    #[test]
    fn future_adapter_resolves() {
        let cell = ResultCell::new();
        let handle = ResponseHandle::new(3, Arc::clone(&cell));
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            cell.complete(Ok(response(3)));
        });
        let result = futures::executor::block_on(handle);
        assert_eq!(result.unwrap().sync, 3);
    }
}
