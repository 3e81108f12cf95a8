//! Fixed-size pool of worker threads for jobs that must not run on the
//! caller's thread, such as replaying queued requests.
use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    /// Spawns `size` workers named `{name}-{i}`. A size of zero is raised to one.
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            match Worker::new(format!("{name}-{i}"), Arc::clone(&receiver)) {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!("failed to spawn worker {name}-{i}: {e}"),
            }
        }

        Self { workers, sender }
    }

    /// Queues a job. Returns `false` when the pool is shutting down or has no workers.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            return false;
        }
        match &self.sender {
            Some(sender) => sender.send(Box::new(f)).is_ok(),
            None => false,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.name);

            // a job may drop the last handle to its own pool
            if worker.thread.thread().id() == current {
                continue;
            }
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.name);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    name: String,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: String, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> std::io::Result<Self> {
        let id = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                let msg = match receiver.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => break,
                };
                match msg {
                    Ok(job) => job(),
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { name, thread })
    }
}
