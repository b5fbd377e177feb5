//! Classification engine lifecycle and end-to-end job processing

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagstream_classifiers::{TagRetriever, Tagger, TaggerCache};
use tagstream_core::{Error, Result};
use tagstream_engine::{
    ClassificationEngine, ClassificationJob, EngineOptions, JobState, Tagging, TaggingPublisher,
};
use tagstream_store::{Entry, ItemCache, ItemCacheOptions};
use tempfile::TempDir;

const TAG_URL: &str = "http://localhost:8888/seangeo/tags/a-religion/training.atom";
const COMPLETE_TAG: &str =
    include_str!("../../tagstream-classifiers/tests/fixtures/complete_tag.atom");

struct MockRetriever {
    documents: HashMap<String, String>,
    delay: Duration,
}

impl MockRetriever {
    fn empty() -> Self {
        Self {
            documents: HashMap::new(),
            delay: Duration::ZERO,
        }
    }

    fn with_tag() -> Self {
        let mut retriever = Self::empty();
        retriever
            .documents
            .insert(TAG_URL.to_string(), COMPLETE_TAG.to_string());
        retriever
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl TagRetriever for MockRetriever {
    async fn retrieve(&self, tag_url: &str) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.documents
            .get(tag_url)
            .cloned()
            .ok_or_else(|| Error::network(format!("GET {tag_url} returned 404 Not Found")))
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<Tagging>)>>,
}

#[async_trait]
impl TaggingPublisher for RecordingPublisher {
    async fn publish(&self, tagger: &Tagger, taggings: &[Tagging]) -> Result<()> {
        self.published
            .lock()
            .push((tagger.tag_id().to_string(), taggings.to_vec()));
        Ok(())
    }
}

/// Ten items: the tag's five examples plus five unrelated ones
fn item_store(dir: &TempDir) -> Arc<ItemCache> {
    ItemCache::initialize(dir.path()).unwrap();
    let items = ItemCache::create(dir.path(), ItemCacheOptions::default()).unwrap();
    let entries = [
        (753459, "faith prayer temple scripture"),
        (886294, "temple monks prayer meditation"),
        (888769, "monastery prayer scripture"),
        (884409, "pilgrimage temple faith"),
        (880389, "earnings revenue quarter profit"),
        (1, "revenue profit market shares"),
        (2, "football season opener tonight"),
        (3, "prayer temple gathering faith"),
        (4, "weather forecast rain tomorrow"),
        (5, "quarterly revenue earnings report"),
    ];
    for (id, words) in entries {
        items
            .add_entry(&Entry {
                id,
                title: String::new(),
                author: None,
                link: None,
                updated: Utc::now(),
                content: words.to_string(),
                feed_id: None,
            })
            .unwrap();
    }
    items.load().unwrap();
    Arc::new(items)
}

fn engine_with(
    dir: &TempDir,
    retriever: MockRetriever,
    publisher: Arc<RecordingPublisher>,
) -> ClassificationEngine {
    let items = item_store(dir);
    let taggers = TaggerCache::new(items, Arc::new(retriever), 1).unwrap();
    let options = EngineOptions {
        worker_threads: 2,
        tagger_wait_timeout_secs: 5,
        ..Default::default()
    };
    ClassificationEngine::new(options, taggers, publisher)
}

fn wait_until_finished(job: &ClassificationJob) -> JobState {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = job.state();
        if state.is_terminal() || Instant::now() > deadline {
            return state;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_until_running(job: &ClassificationJob) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if job.state() == JobState::Running {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_new_job_is_waiting() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, MockRetriever::empty(), Arc::default());

    let job = engine.add_classification_job(TAG_URL);
    assert_eq!(job.state(), JobState::Waiting);
    assert_eq!(job.progress(), 0.0);
    assert_eq!(job.tag_url(), TAG_URL);
    assert_eq!(engine.num_jobs_in_system(), 1);
    assert_eq!(engine.num_waiting_jobs(), 1);

    let fetched = engine.fetch_classification_job(job.id()).unwrap();
    assert_eq!(fetched.id(), job.id());
    assert!(engine.fetch_classification_job("no-such-job").is_none());
}

#[test]
fn test_cancelled_job_is_dropped_by_worker() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, MockRetriever::empty(), Arc::default());

    let job = engine.add_classification_job(TAG_URL);
    assert!(engine.cancel(&job));
    assert_eq!(engine.num_waiting_jobs(), 1);
    assert!(engine.fetch_classification_job(job.id()).is_none());

    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    engine.stop();

    assert_eq!(engine.num_waiting_jobs(), 0);
    assert_eq!(engine.num_jobs_in_system(), 0);
    assert!(engine.fetch_classification_job(job.id()).is_none());
}

#[test]
fn test_suspended_engine_leaves_jobs_waiting() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, MockRetriever::empty(), Arc::default());

    engine.suspend();
    engine.add_classification_job(TAG_URL);
    engine.add_classification_job(TAG_URL);
    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    engine.stop();

    assert_eq!(engine.num_waiting_jobs(), 2);
    assert_eq!(engine.num_jobs_in_system(), 2);
}

#[test]
fn test_resume_drains_queue() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, MockRetriever::empty(), Arc::default());

    engine.suspend();
    let first = engine.add_classification_job(TAG_URL);
    let second = engine.add_classification_job(TAG_URL);
    engine.start().unwrap();
    engine.resume();
    engine.stop();

    assert_eq!(engine.num_waiting_jobs(), 0);
    assert!(first.state().is_terminal());
    assert!(second.state().is_terminal());
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, MockRetriever::empty(), Arc::default());

    assert!(!engine.is_running());
    engine.start().unwrap();
    engine.start().unwrap();
    assert!(engine.is_running());
    engine.stop();
    engine.stop();
    assert!(!engine.is_running());
}

#[test]
fn test_remove_only_finished_jobs() {
    let dir = TempDir::new().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = engine_with(&dir, MockRetriever::with_tag(), publisher);

    let job = engine.add_classification_job(TAG_URL);
    assert!(!engine.remove_classification_job(&job, false));
    assert_eq!(engine.num_jobs_in_system(), 1);

    engine.start().unwrap();
    assert_eq!(wait_until_finished(&job), JobState::Complete);
    assert!(engine.remove_classification_job(&job, false));
    assert_eq!(engine.num_jobs_in_system(), 0);
    assert!(!engine.remove_classification_job(&job, false));
}

#[test]
fn test_remove_failed_job_but_not_running_one() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(
        &dir,
        MockRetriever::empty().with_delay(Duration::from_millis(300)),
        Arc::default(),
    );

    let job = engine.add_classification_job(TAG_URL);
    engine.start().unwrap();
    assert!(wait_until_running(&job));
    assert!(!engine.remove_classification_job(&job, false));
    assert_eq!(engine.num_jobs_in_system(), 1);

    assert_eq!(wait_until_finished(&job), JobState::Error);
    assert!(engine.remove_classification_job(&job, false));
    assert_eq!(engine.num_jobs_in_system(), 0);
}

#[test]
fn test_cancelling_running_job_skips_publishing() {
    let dir = TempDir::new().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = engine_with(
        &dir,
        MockRetriever::with_tag().with_delay(Duration::from_millis(400)),
        publisher.clone(),
    );

    let job = engine.add_classification_job(TAG_URL);
    engine.start().unwrap();
    assert!(wait_until_running(&job));
    assert!(engine.cancel(&job));
    assert!(engine.fetch_classification_job(job.id()).is_none());

    // Outlive the tag fetch so the worker sees the cancellation
    std::thread::sleep(Duration::from_millis(800));
    engine.stop();

    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(engine.num_jobs_in_system(), 0);
    assert_eq!(engine.num_waiting_jobs(), 0);
    assert!(publisher.published.lock().is_empty());
    assert!(!engine.remove_classification_job(&job, false));
}

#[test]
fn test_forced_removal_takes_waiting_job_out_of_queue() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, MockRetriever::empty(), Arc::default());

    let job = engine.add_classification_job(TAG_URL);
    assert!(engine.remove_classification_job(&job, true));
    assert_eq!(engine.num_waiting_jobs(), 0);
    assert_eq!(engine.num_jobs_in_system(), 0);
}

#[test]
fn test_job_classifies_all_items_and_publishes() {
    let dir = TempDir::new().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = engine_with(&dir, MockRetriever::with_tag(), publisher.clone());

    let job = engine.add_classification_job(TAG_URL);
    assert_eq!(engine.num_jobs_in_system(), 1);
    engine.start().unwrap();

    assert_eq!(wait_until_finished(&job), JobState::Complete);
    assert_eq!(engine.num_waiting_jobs(), 0);

    let snapshot = job.snapshot();
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(snapshot.items_classified, 10);
    assert!(snapshot.error_message.is_none());
    assert!(snapshot.duration >= 0.0);

    let published = publisher.published.lock();
    assert_eq!(published.len(), 1);
    let (tag_id, taggings) = &published[0];
    assert_eq!(tag_id, "http://trunk.mindloom.org:80/seangeo/tags/a-religion");
    assert_eq!(taggings.len(), snapshot.taggings);
    assert!(taggings.iter().all(|tagging| tagging.strength >= 0.9));
}

#[test]
fn test_missing_tag_fails_job() {
    let dir = TempDir::new().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = engine_with(&dir, MockRetriever::empty(), publisher.clone());

    let job = engine.add_classification_job(TAG_URL);
    engine.start().unwrap();

    assert_eq!(wait_until_finished(&job), JobState::Error);
    assert!(job.error_message().unwrap().contains("404"));
    assert!(publisher.published.lock().is_empty());
    // Failed jobs stay visible until removed
    assert!(engine.fetch_classification_job(job.id()).is_some());
}
