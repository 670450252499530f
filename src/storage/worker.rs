use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error};
use tokio::sync::oneshot;

use super::database::Database;
use crate::configuration::DatabaseConfig;
use crate::error_handling::types::DbError;

type Job = Box<dyn FnOnce(&mut Database) + Send + 'static>;

/// Fixed set of threads doing the blocking storage work.
///
/// Every worker owns its own [`Database`] (connection, transaction state and
/// clock cache); nothing storage related is shared between threads. Jobs are
/// picked up by whichever worker is idle, so completion order across jobs is
/// unspecified.
pub struct StoragePool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl StoragePool {
    pub fn new(settings: &DatabaseConfig, size: usize) -> Result<Self, DbError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let mut database = Database::new(settings)?;
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("storage-{index}"))
                .spawn(move || worker_loop(index, &receiver, &mut database))
                .map_err(DbError::Runtime)?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queues `job` without waiting for it.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce(&mut Database) + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            error!("Storage pool is shut down, dropping job");
            return;
        };
        if sender.send(Box::new(job)).is_err() {
            error!("All storage workers are gone, dropping job");
        }
    }

    /// Queues `job` and waits for its result without blocking the caller's
    /// thread. `None` means the job never ran or panicked.
    pub async fn call<T, F>(&self, job: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> T + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.execute(move |database| {
            let _ = reply.send(job(database));
        });
        response.await.ok()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting jobs, lets the queued ones finish and joins the
    /// workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("A storage worker terminated abnormally");
            }
        }
    }
}

impl Drop for StoragePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, receiver: &Mutex<mpsc::Receiver<Job>>, database: &mut Database) {
    debug!("Storage worker {index} started");
    loop {
        let job = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        let Ok(job) = job else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(|| job(database))).is_err() {
            error!("Storage job panicked on worker {index}");
        }
    }
    debug!("Storage worker {index} stopped");
}
