//! Checkout-based cache of taggers keyed by tag URL
//!
//! Lookups never perform network I/O: a miss returns `NotFound` and the caller
//! asks for a background fetch, which runs on a dedicated runtime separate
//! from the classification workers. A tag definition may be served by this
//! same process, so a blocking fetch on a request thread could deadlock.
//!
//! Each ready tagger lives in a slot shared through `Arc`. Checking out a
//! tagger clones the slot and bumps its counter; a refresh swaps the slot in
//! the map, leaving holders of the old slot with a stable snapshot.

use crate::definition::TagDefinition;
use crate::retriever::TagRetriever;
use crate::tagger::Tagger;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tagstream_core::{Error, Result};
use tagstream_store::ItemCache;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, warn};

/// Failed tags remembered before the oldest failures are forgotten
pub const DEFAULT_FAILED_TAG_LIMIT: usize = 1024;

/// Externally visible state of one tag URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggerState {
    Absent,
    Fetching,
    Failed,
    Ready,
}

/// Outcome of a non-fetching lookup
pub enum TaggerLookup {
    /// No usable tagger; consult `is_failed_tag` before fetching
    NotFound,
    /// The cache index is being swapped; retry shortly
    CheckedOut,
    /// A checked-out tagger, released when the handle is dropped
    Ok(TaggerHandle),
}

impl fmt::Debug for TaggerLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggerLookup::NotFound => f.write_str("NotFound"),
            TaggerLookup::CheckedOut => f.write_str("CheckedOut"),
            TaggerLookup::Ok(handle) => write!(f, "Ok({})", handle.tag_id()),
        }
    }
}

struct TaggerSlot {
    tagger: Tagger,
    checkouts: AtomicUsize,
}

/// A checked-out tagger
pub struct TaggerHandle {
    slot: Arc<TaggerSlot>,
}

impl TaggerHandle {
    fn checkout(slot: &Arc<TaggerSlot>) -> Self {
        slot.checkouts.fetch_add(1, Ordering::SeqCst);
        Self {
            slot: Arc::clone(slot),
        }
    }

    /// Number of live checkouts of this snapshot, including this one
    pub fn checkout_count(&self) -> usize {
        self.slot.checkouts.load(Ordering::SeqCst)
    }
}

impl Deref for TaggerHandle {
    type Target = Tagger;

    fn deref(&self) -> &Tagger {
        &self.slot.tagger
    }
}

impl Drop for TaggerHandle {
    fn drop(&mut self) {
        self.slot.checkouts.fetch_sub(1, Ordering::SeqCst);
    }
}

enum CacheEntry {
    Fetching { previous: Option<Arc<TaggerSlot>> },
    Ready(Arc<TaggerSlot>),
}

/// Most recent fetch error per tag, oldest evicted first
#[derive(Default)]
struct FailedTags {
    errors: HashMap<String, String>,
    order: VecDeque<String>,
}

impl FailedTags {
    fn insert(&mut self, tag_url: &str, error: String, limit: usize) {
        if self.errors.insert(tag_url.to_string(), error).is_none() {
            self.order.push_back(tag_url.to_string());
        }
        while self.errors.len() > limit.max(1) {
            match self.order.pop_front() {
                Some(oldest) => {
                    debug!(tag_url = %oldest, "Forgetting failed tag");
                    self.errors.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, tag_url: &str) {
        if self.errors.remove(tag_url).is_some() {
            self.order.retain(|url| url != tag_url);
        }
    }
}

struct Shared {
    entries: RwLock<HashMap<String, CacheEntry>>,
    failed: RwLock<FailedTags>,
    failed_limit: AtomicUsize,
    items: Arc<ItemCache>,
    retriever: Arc<dyn TagRetriever>,
}

/// Owns the fetch runtime; shutting it down must not block the caller
struct FetchPool {
    runtime: Option<Runtime>,
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Cache of taggers with background fetching and failure memoization
#[derive(Clone)]
pub struct TaggerCache {
    shared: Arc<Shared>,
    _runtime: Arc<FetchPool>,
    handle: Handle,
}

impl TaggerCache {
    /// Create a cache whose fetches run on `fetch_threads` dedicated threads
    pub fn new(
        items: Arc<ItemCache>,
        retriever: Arc<dyn TagRetriever>,
        fetch_threads: usize,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(fetch_threads.max(1))
            .thread_name("tagger-fetch")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        info!("Tagger cache started with {} fetch threads", fetch_threads.max(1));

        Ok(Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                failed: RwLock::new(FailedTags::default()),
                failed_limit: AtomicUsize::new(DEFAULT_FAILED_TAG_LIMIT),
                items,
                retriever,
            }),
            _runtime: Arc::new(FetchPool {
                runtime: Some(runtime),
            }),
            handle,
        })
    }

    /// Cap the number of remembered failed tags; the oldest are forgotten
    /// first and become fetchable again
    pub fn set_failed_tag_limit(&self, limit: usize) {
        self.shared.failed_limit.store(limit.max(1), Ordering::SeqCst);
    }

    /// Handle to the background runtime, for async work started from
    /// non-async threads
    pub fn runtime_handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn item_cache(&self) -> &Arc<ItemCache> {
        &self.shared.items
    }

    /// Check out the tagger for `tag_url` if one is ready. Never blocks.
    pub fn get_tagger_without_fetching(&self, tag_url: &str) -> TaggerLookup {
        let Some(entries) = self.shared.entries.try_read() else {
            return TaggerLookup::CheckedOut;
        };
        match entries.get(tag_url) {
            Some(CacheEntry::Ready(slot))
            | Some(CacheEntry::Fetching {
                previous: Some(slot),
            }) => TaggerLookup::Ok(TaggerHandle::checkout(slot)),
            _ => TaggerLookup::NotFound,
        }
    }

    /// Release a checked-out tagger. Dropping the handle has the same effect.
    pub fn release_tagger(&self, tagger: TaggerHandle) {
        drop(tagger);
    }

    /// Start fetching `tag_url` unless it is already ready or in flight.
    ///
    /// Returns whether a new fetch was started.
    pub fn fetch_tagger_in_background(&self, tag_url: &str) -> bool {
        self.start_fetch(tag_url, false)
    }

    /// Re-fetch a tag, keeping the current tagger available until the new
    /// one replaces it
    pub fn refresh(&self, tag_url: &str) -> bool {
        self.start_fetch(tag_url, true)
    }

    fn start_fetch(&self, tag_url: &str, refresh: bool) -> bool {
        {
            let mut entries = self.shared.entries.write();
            let previous = match entries.get(tag_url) {
                Some(CacheEntry::Fetching { .. }) => return false,
                Some(CacheEntry::Ready(_)) if !refresh => return false,
                Some(CacheEntry::Ready(slot)) => Some(Arc::clone(slot)),
                None => None,
            };
            entries.insert(tag_url.to_string(), CacheEntry::Fetching { previous });
        }

        debug!(tag_url, refresh, "Scheduling tagger fetch");
        let shared = Arc::clone(&self.shared);
        let url = tag_url.to_string();
        self.handle.spawn(run_fetch(shared, url));
        true
    }

    /// Whether the most recent fetch of `tag_url` failed
    pub fn is_failed_tag(&self, tag_url: &str) -> bool {
        self.shared.failed.read().errors.contains_key(tag_url)
    }

    pub fn num_failed_tags(&self) -> usize {
        self.shared.failed.read().errors.len()
    }

    /// Error recorded by the most recent failed fetch
    pub fn fetch_error(&self, tag_url: &str) -> Option<String> {
        self.shared.failed.read().errors.get(tag_url).cloned()
    }

    pub fn state(&self, tag_url: &str) -> TaggerState {
        match self.shared.entries.read().get(tag_url) {
            Some(CacheEntry::Fetching { .. }) => return TaggerState::Fetching,
            Some(CacheEntry::Ready(_)) => return TaggerState::Ready,
            None => {}
        }
        if self.is_failed_tag(tag_url) {
            TaggerState::Failed
        } else {
            TaggerState::Absent
        }
    }

    /// Live checkouts of the tagger currently mapped to `tag_url`
    pub fn checkout_count(&self, tag_url: &str) -> usize {
        match self.shared.entries.read().get(tag_url) {
            Some(CacheEntry::Ready(slot))
            | Some(CacheEntry::Fetching {
                previous: Some(slot),
            }) => slot.checkouts.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Install an already built tagger
    pub fn insert(&self, tag_url: &str, tagger: Tagger) {
        install(&self.shared, tag_url, tagger);
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn install(shared: &Shared, tag_url: &str, tagger: Tagger) {
    let slot = Arc::new(TaggerSlot {
        tagger,
        checkouts: AtomicUsize::new(0),
    });
    shared
        .entries
        .write()
        .insert(tag_url.to_string(), CacheEntry::Ready(slot));
    shared.failed.write().remove(tag_url);
}

async fn run_fetch(shared: Arc<Shared>, tag_url: String) {
    let result = match AssertUnwindSafe(fetch_and_build(&shared, &tag_url))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => {
            error!(tag_url = %tag_url, "Tagger fetch panicked");
            Err(Error::internal("tagger fetch panicked"))
        }
    };

    match result {
        Ok(tagger) => {
            info!(tag_url = %tag_url, clues = tagger.num_clues(), "Tagger ready");
            install(&shared, &tag_url, tagger);
            metrics::counter!("tagstream_tagger_fetches_total", "outcome" => "success").increment(1);
        }
        Err(e) => {
            warn!(tag_url = %tag_url, "Tagger fetch failed: {}", e);
            // Failure must be visible before the entry disappears
            let limit = shared.failed_limit.load(Ordering::SeqCst);
            shared.failed.write().insert(&tag_url, e.to_string(), limit);
            shared.entries.write().remove(&tag_url);
            metrics::counter!("tagstream_tagger_fetches_total", "outcome" => "failure").increment(1);
        }
    }
}

async fn fetch_and_build(shared: &Shared, tag_url: &str) -> Result<Tagger> {
    let document = shared.retriever.retrieve(tag_url).await?;
    let items = Arc::clone(&shared.items);

    tokio::task::spawn_blocking(move || -> Result<Tagger> {
        let definition = TagDefinition::from_atom(&document)?;
        let tagger = Tagger::build(definition, &items)?;
        items.protect_items(tagger.resolved_examples())?;
        Ok(tagger)
    })
    .await
    .map_err(|e| Error::internal(format!("tagger build task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tagstream_store::ItemCacheOptions;
    use tempfile::TempDir;

    struct NeverRetriever;

    #[async_trait]
    impl TagRetriever for NeverRetriever {
        async fn retrieve(&self, tag_url: &str) -> Result<String> {
            Err(Error::network(format!("{tag_url} unreachable")))
        }
    }

    fn cache(dir: &TempDir) -> TaggerCache {
        ItemCache::initialize(dir.path()).unwrap();
        let items = Arc::new(ItemCache::create(dir.path(), ItemCacheOptions::default()).unwrap());
        TaggerCache::new(items, Arc::new(NeverRetriever), 1).unwrap()
    }

    fn tagger() -> Tagger {
        let definition = TagDefinition::from_atom("<feed><id>tag:t</id></feed>").unwrap();
        Tagger::from_pools(definition, &Default::default(), &Default::default())
    }

    #[test]
    fn test_lookup_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert!(matches!(
            cache.get_tagger_without_fetching("http://x/tag"),
            TaggerLookup::NotFound
        ));
        assert_eq!(cache.state("http://x/tag"), TaggerState::Absent);
        assert!(!cache.is_failed_tag("http://x/tag"));
    }

    #[test]
    fn test_checkout_counts() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.insert("http://x/tag", tagger());

        let first = match cache.get_tagger_without_fetching("http://x/tag") {
            TaggerLookup::Ok(handle) => handle,
            other => panic!("expected tagger, got {:?}", other),
        };
        let second = match cache.get_tagger_without_fetching("http://x/tag") {
            TaggerLookup::Ok(handle) => handle,
            other => panic!("expected tagger, got {:?}", other),
        };
        assert_eq!(cache.checkout_count("http://x/tag"), 2);
        assert_eq!(first.tag_id(), "tag:t");

        cache.release_tagger(first);
        assert_eq!(cache.checkout_count("http://x/tag"), 1);
        drop(second);
        assert_eq!(cache.checkout_count("http://x/tag"), 0);
    }

    #[test]
    fn test_swap_keeps_old_snapshot() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.insert("http://x/tag", tagger());
        let old = match cache.get_tagger_without_fetching("http://x/tag") {
            TaggerLookup::Ok(handle) => handle,
            other => panic!("expected tagger, got {:?}", other),
        };

        let replacement = TagDefinition::from_atom("<feed><id>tag:new</id></feed>").unwrap();
        cache.insert(
            "http://x/tag",
            Tagger::from_pools(replacement, &Default::default(), &Default::default()),
        );

        assert_eq!(old.tag_id(), "tag:t");
        assert_eq!(old.checkout_count(), 1);
        assert_eq!(cache.checkout_count("http://x/tag"), 0);
        match cache.get_tagger_without_fetching("http://x/tag") {
            TaggerLookup::Ok(handle) => assert_eq!(handle.tag_id(), "tag:new"),
            other => panic!("expected tagger, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_tags_evict_oldest() {
        let mut failed = FailedTags::default();
        failed.insert("http://a/tag", "404".into(), 2);
        failed.insert("http://b/tag", "404".into(), 2);
        failed.insert("http://a/tag", "500".into(), 2);
        assert_eq!(failed.errors.len(), 2);

        failed.insert("http://c/tag", "404".into(), 2);
        assert!(!failed.errors.contains_key("http://a/tag"));
        assert!(failed.errors.contains_key("http://b/tag"));
        assert!(failed.errors.contains_key("http://c/tag"));

        failed.remove("http://b/tag");
        assert_eq!(failed.order, VecDeque::from(["http://c/tag".to_string()]));
    }

    #[test]
    fn test_ready_tag_is_not_refetched() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.insert("http://x/tag", tagger());
        assert!(!cache.fetch_tagger_in_background("http://x/tag"));
        assert_eq!(cache.state("http://x/tag"), TaggerState::Ready);
    }
}
