//! Background task that owns the database
//!
//! Every database call is issued by this task. Between requests it runs
//! ingestion slices, sleeping until the database asks to be woken. Calls that
//! write to the store run on the blocking thread pool.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use safebrowsing_chunk::{SbChunk, SbChunkDelete, SbFullHashResult, SbListChunkRanges};
use safebrowsing_db::{Database, DatabaseError, DatabaseStats, UrlCheck, WorkStatus};
use safebrowsing_hash::SbPrefix;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::Stats;

/// Pause before retrying work that failed without corrupting the store
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(30);

type Reply<T> = oneshot::Sender<T>;
type DbResult<T> = safebrowsing_db::Result<T>;
type SharedDatabase = Arc<std::sync::Mutex<Box<dyn Database + Send>>>;

/// Request sent to the worker
pub(crate) enum Command {
    InsertChunks {
        list_name: String,
        chunks: Vec<SbChunk>,
        reply: Reply<DbResult<()>>,
    },
    DeleteChunks {
        deletes: Vec<SbChunkDelete>,
        reply: Reply<DbResult<()>>,
    },
    ContainsUrl {
        url: String,
        reply: Reply<UrlCheck>,
    },
    CacheHashResults {
        requested: Vec<SbPrefix>,
        results: Vec<SbFullHashResult>,
        reply: Reply<()>,
    },
    GetListsInfo {
        reply: Reply<DbResult<Vec<SbListChunkRanges>>>,
    },
    UpdateStarted {
        reply: Reply<DbResult<()>>,
    },
    UpdateFinished {
        success: bool,
        reply: Reply<DbResult<()>>,
    },
    HandleResume {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<DatabaseStats>,
    },
    Reset {
        reply: Reply<DbResult<()>>,
    },
}

pub(crate) struct Worker {
    database: SharedDatabase,
    stats: Arc<Mutex<Stats>>,
    wake_at: Option<Instant>,
}

impl Worker {
    pub(crate) fn new(database: Box<dyn Database + Send>, stats: Arc<Mutex<Stats>>) -> Self {
        Self {
            database: Arc::new(std::sync::Mutex::new(database)),
            stats,
            // Pick up work queued while opening, such as a filter rebuild.
            wake_at: Some(Instant::now()),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Database worker shutting down");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("Command channel closed");
                        break;
                    }
                },
                _ = wake(self.wake_at) => {}
            }

            self.process_pending().await;
        }
    }

    /// Run `f` against the database on this task.
    fn with_database<T>(&self, f: impl FnOnce(&mut (dyn Database + Send)) -> T) -> T {
        let mut database = self.database.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut **database)
    }

    /// Run a store-writing call on the blocking pool.
    ///
    /// A call that panics leaves the store in an unknown state and is
    /// reported as corruption.
    async fn blocking<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut (dyn Database + Send)) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let database = Arc::clone(&self.database);
        tokio::task::spawn_blocking(move || {
            let mut database = database.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut **database)
        })
        .await
        .unwrap_or_else(|e| Err(DatabaseError::Corrupt(format!("Database task failed: {e}"))))
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::InsertChunks {
                list_name,
                chunks,
                reply,
            } => {
                let result = self
                    .blocking(move |db| db.insert_chunks(&list_name, chunks))
                    .await;
                self.finish(result, reply).await;
            }
            Command::DeleteChunks { deletes, reply } => {
                let result = self.blocking(move |db| db.delete_chunks(deletes)).await;
                self.finish(result, reply).await;
            }
            Command::ContainsUrl { url, reply } => {
                let (check, corrupt) =
                    self.with_database(|db| (db.contains_url(&url), db.corruption_detected()));
                let _ = reply.send(check);
                if corrupt {
                    self.reset().await;
                }
            }
            Command::CacheHashResults {
                requested,
                results,
                reply,
            } => {
                self.with_database(|db| db.cache_hash_results(&requested, &results));
                let _ = reply.send(());
            }
            Command::GetListsInfo { reply } => {
                let result = self.with_database(|db| db.get_lists_info());
                let corrupt = result.as_ref().is_err_and(DatabaseError::is_corrupt);
                let _ = reply.send(result);
                if corrupt {
                    self.reset().await;
                }
            }
            Command::UpdateStarted { reply } => {
                let result = self.with_database(|db| db.update_started());
                self.finish(result, reply).await;
            }
            Command::UpdateFinished { success, reply } => {
                let result = self
                    .blocking(move |db| db.update_finished(success))
                    .await;
                self.finish(result, reply).await;
            }
            Command::HandleResume { reply } => {
                self.with_database(|db| db.handle_resume());
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.with_database(|db| db.stats()));
            }
            Command::Reset { reply } => {
                let result = self.blocking(|db| db.reset()).await;
                if result.is_ok() {
                    self.stats.lock().await.resets += 1;
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Reply with `result`, resetting the database first if it is corrupt.
    async fn finish(&mut self, result: DbResult<()>, reply: Reply<DbResult<()>>) {
        let corrupt = result.as_ref().is_err_and(DatabaseError::is_corrupt);
        if corrupt {
            self.reset().await;
        }
        let _ = reply.send(result);
    }

    async fn reset(&mut self) {
        error!("Database corruption detected, resetting");
        match self.blocking(|db| db.reset()).await {
            Ok(()) => self.stats.lock().await.resets += 1,
            Err(e) => error!("Failed to reset database: {}", e),
        }
    }

    async fn process_pending(&mut self) {
        self.wake_at = match self.blocking(|db| db.process_pending()).await {
            Ok(WorkStatus::Idle) => None,
            Ok(WorkStatus::Busy) => Some(Instant::now()),
            Ok(WorkStatus::WaitUntil(at)) => Some(Instant::from_std(at)),
            Err(e) => {
                error!("Failed to process pending work: {}", e);
                if e.is_corrupt() {
                    self.reset().await;
                    Some(Instant::now())
                } else {
                    Some(Instant::now() + ERROR_RETRY_DELAY)
                }
            }
        };
    }
}

async fn wake(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
