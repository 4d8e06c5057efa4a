//! Concurrent page downloads.
//!
//! [`DownloadManager::download_all`] drives a fixed number of spawned fetches
//! from one coordinating loop. Only that loop touches the pending queue, the
//! in-flight set and the cooldown deadline; each spawned fetch owns its task
//! and its destination until it reports back.

use crate::error::FetchError;
use crate::manga::PageDescriptor;
use crate::net::{ByteStream, Request, Transport};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    task::{Id, JoinSet},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod retry;
pub mod storage;

pub use retry::RetryPolicy;
pub use storage::{FsStorage, Storage};
use storage::Sink;

/// One page to fetch and the storage key to put it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub descriptor: PageDescriptor,
    pub destination: String,
    /// 1-based number of the attempt currently scheduled.
    pub attempt: u32,
}

impl DownloadTask {
    pub fn new(descriptor: PageDescriptor, destination: impl Into<String>) -> Self {
        Self {
            descriptor,
            destination: destination.into(),
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailReason {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("writing to storage failed: {0}")]
    Storage(String),
    #[error("cancelled")]
    Cancelled,
    #[error("download worker died: {0}")]
    Worker(String),
}

impl FailReason {
    fn is_retryable(&self) -> bool {
        matches!(self, FailReason::Fetch(e) if e.is_retryable())
    }

    fn is_rate_limited(&self) -> bool {
        matches!(self, FailReason::Fetch(e) if e.is_rate_limited())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { bytes: u64 },
    Failed(FailReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Position of the task in the input.
    pub index: usize,
    /// The task as it stood when it finished; `attempt` is the number of
    /// attempts made.
    pub task: DownloadTask,
    pub outcome: Outcome,
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

/// Receives one event per finished task.
pub trait Progress: Send + Sync {
    fn on_complete(&self, index: usize, outcome: &Outcome);
}

impl Progress for () {
    fn on_complete(&self, _index: usize, _outcome: &Outcome) {}
}

#[derive(Debug)]
struct Pending {
    index: usize,
    task: DownloadTask,
    not_before: Instant,
}

/// Admission bookkeeping: the FIFO of waiting tasks and the pool-wide
/// cooldown deadline.
#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<Pending>,
    cooldown_until: Option<Instant>,
}

impl Queue {
    fn new(tasks: Vec<DownloadTask>, now: Instant) -> Self {
        Self {
            pending: tasks
                .into_iter()
                .enumerate()
                .map(|(index, task)| Pending {
                    index,
                    task,
                    not_before: now,
                })
                .collect(),
            cooldown_until: None,
        }
    }

    /// The first task in queue order that is allowed to start at `now`.
    fn admit(&mut self, now: Instant) -> Option<Pending> {
        if self.cooldown_until.is_some_and(|until| until > now) {
            return None;
        }
        let position = self.pending.iter().position(|p| p.not_before <= now)?;
        self.pending.remove(position)
    }

    fn requeue(&mut self, index: usize, task: DownloadTask, not_before: Instant) {
        self.pending.push_back(Pending {
            index,
            task,
            not_before,
        });
    }

    fn cool_down(&mut self, until: Instant) {
        self.cooldown_until = Some(self.cooldown_until.map_or(until, |old| old.max(until)));
    }

    /// When admission could next succeed, if anything is waiting.
    fn next_wake(&self) -> Option<Instant> {
        let earliest = self.pending.iter().map(|p| p.not_before).min()?;
        Some(match self.cooldown_until {
            Some(until) => earliest.max(until),
            None => earliest,
        })
    }
}

type Finished = (usize, DownloadTask, Result<u64, FailReason>);

pub struct DownloadManager<T: ?Sized, S: ?Sized> {
    transport: Arc<T>,
    storage: Arc<S>,
    headers: HeaderMap,
    concurrency: usize,
    policy: RetryPolicy,
}

impl<T, S> DownloadManager<T, S>
where
    T: Transport + ?Sized,
    S: Storage + ?Sized,
{
    pub fn new(transport: Arc<T>, storage: Arc<S>, concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            transport,
            storage,
            headers: HeaderMap::new(),
            concurrency: concurrency.max(1),
            policy,
        }
    }

    /// Headers sent with every image request, e.g. the referer the image
    /// host insists on.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Downloads every task and returns one result per task, in input order.
    ///
    /// Never fails as a whole. Retryable failures go to the back of the queue
    /// after their backoff; a 429 additionally pauses all admissions for the
    /// policy's cooldown. Once `cancel` fires nothing new is started, running
    /// fetches are left to finish and everything unfinished comes back as
    /// [`FailReason::Cancelled`].
    pub async fn download_all(
        &self,
        tasks: Vec<DownloadTask>,
        cancel: &CancellationToken,
        progress: &dyn Progress,
    ) -> Vec<DownloadResult> {
        let originals = tasks.clone();
        let mut results: Vec<Option<DownloadResult>> = originals.iter().map(|_| None).collect();
        let mut queue = Queue::new(tasks, Instant::now());
        let mut in_flight: JoinSet<Finished> = JoinSet::new();
        let mut running: HashMap<Id, (usize, DownloadTask)> = HashMap::new();

        let mut finish = |index: usize, task: DownloadTask, outcome: Outcome| {
            progress.on_complete(index, &outcome);
            results[index] = Some(DownloadResult {
                index,
                task,
                outcome,
            });
        };

        loop {
            if !cancel.is_cancelled() {
                let now = Instant::now();
                while in_flight.len() < self.concurrency {
                    let Some(next) = queue.admit(now) else {
                        break;
                    };
                    let (id, index, task) = self.spawn(&mut in_flight, next);
                    running.insert(id, (index, task));
                }
            }

            if in_flight.is_empty() && (queue.pending.is_empty() || cancel.is_cancelled()) {
                break;
            }

            let wake = queue
                .next_wake()
                .filter(|_| !cancel.is_cancelled() && in_flight.len() < self.concurrency);

            tokio::select! {
                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    let (index, mut task, result) = match joined {
                        Ok((id, finished)) => {
                            running.remove(&id);
                            finished
                        }
                        Err(e) => {
                            error!("download worker failed: {e}");
                            if let Some((index, task)) = running.remove(&e.id()) {
                                finish(index, task, Outcome::Failed(FailReason::Worker(e.to_string())));
                            }
                            continue;
                        }
                    };
                    match result {
                        Ok(bytes) => {
                            debug!(index, attempt = task.attempt, bytes, "page saved to {}", task.destination);
                            finish(index, task, Outcome::Success { bytes });
                        }
                        Err(reason) => {
                            let now = Instant::now();
                            if reason.is_rate_limited() {
                                warn!(
                                    "rate limited by {}, pausing new downloads for {:?}",
                                    task.descriptor.url, self.policy.rate_limit_cooldown
                                );
                                queue.cool_down(now + self.policy.rate_limit_cooldown);
                            }

                            if reason.is_retryable() && cancel.is_cancelled() {
                                finish(index, task, Outcome::Failed(FailReason::Cancelled));
                            } else if reason.is_retryable() && self.policy.has_attempts_left(task.attempt) {
                                let delay = self.policy.backoff(task.attempt);
                                warn!(
                                    index,
                                    attempt = task.attempt,
                                    "page {} failed ({reason}), retrying in {delay:?}",
                                    task.descriptor.url
                                );
                                task.attempt += 1;
                                queue.requeue(index, task, now + delay);
                            } else {
                                error!(
                                    index,
                                    attempt = task.attempt,
                                    "giving up on page {}: {reason}",
                                    task.descriptor.url
                                );
                                finish(index, task, Outcome::Failed(reason));
                            }
                        }
                    }
                }
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    info!("download cancelled, waiting for running fetches");
                }
            }
        }

        for pending in queue.pending.drain(..) {
            finish(
                pending.index,
                pending.task,
                Outcome::Failed(FailReason::Cancelled),
            );
        }

        results
            .into_iter()
            .zip(originals)
            .enumerate()
            .map(|(index, (result, task))| {
                result.unwrap_or_else(|| DownloadResult {
                    index,
                    task,
                    outcome: Outcome::Failed(FailReason::Worker("task never reported".into())),
                })
            })
            .collect()
    }

    fn spawn(&self, in_flight: &mut JoinSet<Finished>, next: Pending) -> (Id, usize, DownloadTask) {
        let Pending { index, task, .. } = next;
        let tracked = task.clone();
        debug!(
            index,
            attempt = task.attempt,
            "fetching {}",
            task.descriptor.url
        );
        let mut request = Request::get(task.descriptor.url.clone());
        request.headers = self.headers.clone();
        let transport = self.transport.clone();
        let storage = self.storage.clone();
        let handle = in_flight.spawn(async move {
            let result = fetch_into(&*transport, &*storage, request, &task.destination).await;
            (index, task, result)
        });
        (handle.id(), index, tracked)
    }
}

/// Streams one GET into `destination`, returning the number of bytes written.
/// Nothing shows up under `destination` unless the whole body arrived.
async fn fetch_into<T, S>(
    transport: &T,
    storage: &S,
    request: Request,
    destination: &str,
) -> Result<u64, FailReason>
where
    T: Transport + ?Sized,
    S: Storage + ?Sized,
{
    let body = transport.get(request).await?;
    let sink = storage
        .open_for_write(destination)
        .await
        .map_err(|e| FailReason::Storage(e.to_string()))?;

    let copied = copy_body(body, sink).await;
    let written = match copied {
        Ok(written) => written,
        Err(reason) => {
            storage.discard(destination).await;
            return Err(reason);
        }
    };
    if let Err(e) = storage.commit(destination).await {
        storage.discard(destination).await;
        return Err(FailReason::Storage(e.to_string()));
    }
    Ok(written)
}

async fn copy_body(mut body: ByteStream, mut sink: Sink) -> Result<u64, FailReason> {
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk)
            .await
            .map_err(|e| FailReason::Storage(e.to_string()))?;
        written += chunk.len() as u64;
    }
    sink.shutdown()
        .await
        .map_err(|e| FailReason::Storage(e.to_string()))?;
    Ok(written)
}
