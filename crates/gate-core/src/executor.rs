//! Sharded executor: per-connection serialized task execution.
//!
//! N single-consumer workers, each owning a bounded FIFO and a
//! [`ShardLocal`] map.  `submit(key, task)` always routes one key to the
//! same worker, so tasks for a given connection run strictly in
//! submission order and shard-local state needs no locking inside a
//! task.  Tasks must not block; they may submit further work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ExecutorError;
use crate::session::UserSession;

pub type ShardTask = Box<dyn FnOnce(&mut ShardLocal) + Send>;

enum Cmd {
    Task(ShardTask),
    Stop,
}

/// One shard's private state: the user sessions whose conn ids hash
/// here.  Only tasks running on the owning worker ever touch it.
#[derive(Default)]
pub struct ShardLocal {
    sessions: HashMap<u64, UserSession>,
}

impl ShardLocal {
    pub fn get(&self, conn_id: u64) -> Option<&UserSession> {
        self.sessions.get(&conn_id)
    }

    pub fn set(&mut self, conn_id: u64, session: UserSession) {
        self.sessions.insert(conn_id, session);
    }

    pub fn remove(&mut self, conn_id: u64) -> Option<UserSession> {
        self.sessions.remove(&conn_id)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&UserSession) -> bool) {
        self.sessions.retain(|_, sess| keep(sess));
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub struct ShardedExecutor {
    shards: Vec<mpsc::Sender<Cmd>>,
    stopped: Arc<AtomicBool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ShardedExecutor {
    /// Spawns `workers` shard tasks, each with a queue of `queue_len`.
    pub fn new(workers: usize, queue_len: usize) -> Self {
        let workers = workers.max(1);
        let queue_len = queue_len.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Cmd>(queue_len);
            shards.push(tx);
            handles.push(tokio::spawn(async move {
                let mut local = ShardLocal::default();
                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        Cmd::Task(task) => task(&mut local),
                        Cmd::Stop => break,
                    }
                }
            }));
        }
        ShardedExecutor {
            shards,
            stopped: Arc::new(AtomicBool::new(false)),
            workers: std::sync::Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }

    /// Enqueues `task` on the shard owning `key`.  Non-blocking.
    pub fn submit(
        &self,
        key: u64,
        task: impl FnOnce(&mut ShardLocal) + Send + 'static,
    ) -> Result<(), ExecutorError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExecutorError::Stopped);
        }
        let shard = &self.shards[(key % self.shards.len() as u64) as usize];
        shard
            .try_send(Cmd::Task(Box::new(task)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ExecutorError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ExecutorError::Stopped,
            })
    }

    /// Enqueues a copy of `task` on every shard.  With `blocking` the
    /// call waits for queue room instead of failing fast.
    pub async fn submit_to_all(
        &self,
        task: impl Fn(&mut ShardLocal) + Send + Sync + Clone + 'static,
        blocking: bool,
    ) -> Result<(), ExecutorError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExecutorError::Stopped);
        }
        for shard in &self.shards {
            let t = task.clone();
            let cmd = Cmd::Task(Box::new(move |local: &mut ShardLocal| t(local)));
            if blocking {
                shard.send(cmd).await.map_err(|_| ExecutorError::Stopped)?;
            } else {
                shard.try_send(cmd).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => ExecutorError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => ExecutorError::Stopped,
                })?;
            }
        }
        Ok(())
    }

    /// Rejects new submissions, lets each worker drain its queue, and
    /// joins them.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for shard in &self.shards {
            let _ = shard.send(Cmd::Stop).await;
        }
        let handles = {
            let mut workers = self.workers.lock().expect("executor worker lock");
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
