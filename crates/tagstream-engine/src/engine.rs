//! Job queue and classification worker pool
//!
//! A fixed set of worker threads drains a FIFO queue of jobs. The queue and
//! the job index share one mutex; each job guards its own mutable fields, so
//! status reads never contend with the queue.
//!
//! Workers stop when the engine is stopped and either the queue is empty or
//! the engine is suspended. Stopping a suspended engine therefore leaves the
//! waiting jobs in place; stopping a running one drains the queue first.

use crate::job::{ClassificationJob, JobState};
use crate::publisher::{Tagging, TaggingPublisher};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tagstream_classifiers::{TaggerCache, TaggerHandle, TaggerLookup, TaggerState};
use tagstream_core::{Error, Result};
use tagstream_store::ItemCache;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);
const IDLE_WAKEUP: Duration = Duration::from_millis(250);

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Number of classification worker threads
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Items scoring at least this probability are reported as taggings
    #[serde(default = "default_positive_threshold")]
    pub positive_threshold: f64,

    /// Upper bound on how long a job waits for its tagger
    #[serde(default = "default_tagger_wait_timeout")]
    pub tagger_wait_timeout_secs: u64,

    /// Items processed between progress updates
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            positive_threshold: default_positive_threshold(),
            tagger_wait_timeout_secs: default_tagger_wait_timeout(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl EngineOptions {
    pub fn tagger_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.tagger_wait_timeout_secs)
    }
}

fn default_worker_threads() -> usize {
    num_cpus::get().max(1)
}

fn default_positive_threshold() -> f64 {
    0.9
}

fn default_tagger_wait_timeout() -> u64 {
    30
}

fn default_progress_interval() -> usize {
    10
}

#[derive(Default)]
struct JobQueue {
    waiting: VecDeque<Arc<ClassificationJob>>,
    index: HashMap<String, Arc<ClassificationJob>>,
}

struct EngineInner {
    options: EngineOptions,
    taggers: TaggerCache,
    items: Arc<ItemCache>,
    publisher: Arc<dyn TaggingPublisher>,
    queue: Mutex<JobQueue>,
    available: Condvar,
    running: AtomicBool,
    suspended: AtomicBool,
}

/// Owns classification jobs and the workers that run them
pub struct ClassificationEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClassificationEngine {
    pub fn new(
        options: EngineOptions,
        taggers: TaggerCache,
        publisher: Arc<dyn TaggingPublisher>,
    ) -> Self {
        let items = Arc::clone(taggers.item_cache());
        Self {
            inner: Arc::new(EngineInner {
                options,
                taggers,
                items,
                publisher,
                queue: Mutex::new(JobQueue::default()),
                available: Condvar::new(),
                running: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn tagger_cache(&self) -> &TaggerCache {
        &self.inner.taggers
    }

    /// Queue a job for `tag_url`
    pub fn add_classification_job(&self, tag_url: &str) -> Arc<ClassificationJob> {
        let job = Arc::new(ClassificationJob::new(tag_url));
        {
            let mut queue = self.inner.queue.lock();
            queue.index.insert(job.id().to_string(), Arc::clone(&job));
            queue.waiting.push_back(Arc::clone(&job));
        }
        self.inner.available.notify_one();

        info!(job_id = job.id(), tag_url, "Classification job queued");
        metrics::counter!("tagstream_jobs_total", "state" => "created").increment(1);
        job
    }

    /// Look up a job by id. Cancelled jobs read as absent.
    pub fn fetch_classification_job(&self, id: &str) -> Option<Arc<ClassificationJob>> {
        self.inner
            .queue
            .lock()
            .index
            .get(id)
            .filter(|job| !job.is_cancelled())
            .cloned()
    }

    /// Remove a finished job. Unfinished jobs are only removed when `force`
    /// is set.
    pub fn remove_classification_job(&self, job: &ClassificationJob, force: bool) -> bool {
        let state = job.state();
        if !force && !matches!(state, JobState::Complete | JobState::Error) {
            return false;
        }

        let mut queue = self.inner.queue.lock();
        let removed = queue.index.remove(job.id()).is_some();
        queue.waiting.retain(|waiting| waiting.id() != job.id());
        debug!(job_id = job.id(), %state, removed, "Classification job removed");
        removed
    }

    /// Cancel a waiting or running job
    pub fn cancel(&self, job: &ClassificationJob) -> bool {
        let cancelled = job.cancel();
        if cancelled {
            info!(job_id = job.id(), "Classification job cancelled");
        }
        cancelled
    }

    /// Jobs known to the engine, including finished ones not yet removed
    pub fn num_jobs_in_system(&self) -> usize {
        self.inner.queue.lock().index.len()
    }

    pub fn num_waiting_jobs(&self) -> usize {
        self.inner.queue.lock().waiting.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Launch the worker pool. Calling it on a running engine does nothing.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let count = self.inner.options.worker_threads.max(1);
        for worker_id in 0..count {
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("classifier-worker-{}", worker_id))
                .spawn(move || worker_loop(inner, worker_id));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("Failed to spawn classification worker: {}", e);
                    drop(workers);
                    self.stop();
                    return Err(Error::Io(e));
                }
            }
        }

        info!(workers = count, "Classification engine started");
        Ok(())
    }

    /// Signal workers to finish and wait for them. Idempotent.
    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            self.inner.running.store(false, Ordering::SeqCst);
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        self.inner.available.notify_all();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Classification worker exited with a panic");
            }
        }
        info!("Classification engine stopped");
    }

    /// Stop dequeuing; jobs already running are unaffected
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
        info!("Classification engine suspended");
    }

    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.available.notify_all();
        info!("Classification engine resumed");
    }
}

impl Drop for ClassificationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<EngineInner>, worker_id: usize) {
    debug!(worker_id, "Classification worker started");
    while let Some(job) = inner.next_job() {
        inner.process(job);
    }
    debug!(worker_id, "Classification worker exiting");
}

impl EngineInner {
    /// Block until a job can be dequeued or the worker should exit
    fn next_job(&self) -> Option<Arc<ClassificationJob>> {
        let mut queue = self.queue.lock();
        loop {
            let suspended = self.suspended.load(Ordering::SeqCst);
            if !suspended {
                if let Some(job) = queue.waiting.pop_front() {
                    return Some(job);
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            self.available.wait_for(&mut queue, IDLE_WAKEUP);
        }
    }

    fn process(&self, job: Arc<ClassificationJob>) {
        if !job.begin() {
            debug!(job_id = job.id(), "Dropping cancelled job");
            self.drop_job(&job);
            return;
        }
        info!(job_id = job.id(), tag_url = job.tag_url(), "Classification job started");

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.run(&job)))
            .unwrap_or_else(|_| Err(Error::internal("classification worker panicked")));

        let state = match outcome {
            Ok(()) => job.complete(),
            Err(Error::Cancelled) => JobState::Cancelled,
            Err(e) => {
                warn!(job_id = job.id(), "Classification job failed: {}", e);
                job.fail(e.to_string())
            }
        };

        if state == JobState::Cancelled {
            self.drop_job(&job);
        }
        metrics::counter!("tagstream_jobs_total", "state" => state.as_str()).increment(1);
        metrics::histogram!("tagstream_job_duration_seconds").record(job.duration());
        info!(
            job_id = job.id(),
            %state,
            duration = job.duration(),
            "Classification job finished"
        );
    }

    fn drop_job(&self, job: &ClassificationJob) {
        self.queue.lock().index.remove(job.id());
    }

    fn run(&self, job: &ClassificationJob) -> Result<()> {
        let tagger = self.checkout_tagger(job)?;

        let total = self.items.cached_size().max(1);
        let threshold = self.options.positive_threshold;
        let interval = self.options.progress_interval.max(1);
        let mut processed = 0usize;
        let mut taggings = Vec::new();

        let result = self.items.each_item(|item| {
            if job.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let strength = tagger.classify(item);
            if strength >= threshold {
                taggings.push(Tagging {
                    item: item.id(),
                    strength,
                });
            }
            processed += 1;
            if processed % interval == 0 {
                job.set_progress(processed as f64 / total as f64);
            }
            Ok(())
        });
        job.record_counts(processed, taggings.len());
        metrics::counter!("tagstream_items_classified_total").increment(processed as u64);
        result?;

        if job.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.publish(&tagger, &taggings)
    }

    fn publish(&self, tagger: &TaggerHandle, taggings: &[Tagging]) -> Result<()> {
        let publisher = Arc::clone(&self.publisher);
        self.taggers
            .runtime_handle()
            .block_on(async move { publisher.publish(tagger, taggings).await })
    }

    /// Wait, with bounded backoff, for the job's tagger to become available.
    ///
    /// A fetch is requested at most once per job unless the tag disappears
    /// again. A fetch that fails after this job asked for it is permanent.
    fn checkout_tagger(&self, job: &ClassificationJob) -> Result<TaggerHandle> {
        let url = job.tag_url();
        let deadline = Instant::now() + self.options.tagger_wait_timeout();
        let mut backoff = INITIAL_BACKOFF;
        let mut requested = false;

        loop {
            match self.taggers.get_tagger_without_fetching(url) {
                TaggerLookup::Ok(tagger) => return Ok(tagger),
                TaggerLookup::CheckedOut => {}
                TaggerLookup::NotFound => match self.taggers.state(url) {
                    TaggerState::Fetching | TaggerState::Ready => {}
                    TaggerState::Failed if requested => {
                        let reason = self
                            .taggers
                            .fetch_error(url)
                            .unwrap_or_else(|| "tag fetch failed".to_string());
                        return Err(Error::network(reason));
                    }
                    TaggerState::Failed | TaggerState::Absent => {
                        self.taggers.fetch_tagger_in_background(url);
                        requested = true;
                    }
                },
            }

            if job.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::unavailable(format!("timed out waiting for tagger {url}")));
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
