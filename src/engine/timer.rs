use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread,
    time::Instant,
};

use log::{debug, warn};

type Fire = Box<dyn Fn(u64) + Send + 'static>;

#[derive(Default)]
struct Schedule {
    queue: BTreeMap<(Instant, u64), ()>,
    running: bool,
}

#[derive(Default)]
struct Shared {
    schedule: Mutex<Schedule>,
    wake: Condvar,
}

/// Deadline queue serviced by one thread.
///
/// Each entry is keyed by its deadline and operation id, so cancelling needs
/// both and costs one map removal.
pub(crate) struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    pub fn start(name: &str, fire: Fire) -> Self {
        let shared = Arc::new(Shared::default());
        shared
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running = true;

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(worker, fire))
            .map_err(|e| warn!("failed to spawn timer thread: {e}"))
            .ok();

        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    pub fn schedule(&self, id: u64, deadline: Instant) {
        let mut schedule = self.lock();
        let earliest = schedule.queue.keys().next().map(|(d, _)| *d);
        schedule.queue.insert((deadline, id), ());
        if earliest.is_none_or(|e| deadline < e) {
            self.shared.wake.notify_all();
        }
    }

    pub fn cancel(&self, id: u64, deadline: Instant) {
        self.lock().queue.remove(&(deadline, id));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stop(&self) {
        {
            let mut schedule = self.lock();
            schedule.running = false;
            schedule.queue.clear();
        }
        self.shared.wake.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.shared
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, fire: Fire) {
    let mut schedule = shared
        .schedule
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    while schedule.running {
        let next = schedule.queue.keys().next().copied();
        match next {
            None => {
                schedule = shared
                    .wake
                    .wait(schedule)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some((deadline, id)) => {
                let now = Instant::now();
                if deadline <= now {
                    schedule.queue.remove(&(deadline, id));
                    drop(schedule);
                    fire(id);
                    schedule = shared
                        .schedule
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                } else {
                    schedule = shared
                        .wake
                        .wait_timeout(schedule, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
    debug!("timer stopped");
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let (tx, rx) = mpsc::channel();
        let timer = Timer::start("timer-order", Box::new(move |id| tx.send(id).unwrap()));
        let now = Instant::now();
        timer.schedule(2, now + Duration::from_millis(40));
        timer.schedule(1, now + Duration::from_millis(10));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert_eq!(timer.len(), 0);
    }

    #[test]
    fn cancelled_entry_never_fires() {
        let (tx, rx) = mpsc::channel();
        let timer = Timer::start("timer-cancel", Box::new(move |id| tx.send(id).unwrap()));
        let deadline = Instant::now() + Duration::from_millis(20);
        timer.schedule(7, deadline);
        timer.cancel(7, deadline);

        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
    }

    #[test]
    fn stop_joins_thread() {
        let timer = Timer::start("timer-stop", Box::new(|_| {}));
        timer.schedule(1, Instant::now() + Duration::from_secs(60));
        timer.stop();
        assert_eq!(timer.len(), 0);
    }
}
