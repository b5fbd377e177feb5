//! In-memory item index over the store journal
//!
//! Reads go through an `RwLock`ed index and never touch the disk once the
//! cache is loaded. Writers serialize on a separate store mutex that covers
//! journal I/O; the index write lock is only taken to apply a mutation that
//! has already been persisted, so a failed write leaves the index untouched.

use crate::atom::Entry;
use crate::journal::{self, Journal, JournalRecord, StoredEntry};
use crate::tokenizer::{Tokenizer, Vocabulary};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tagstream_core::{Error, Feed, FeedId, Item, ItemId, Result, TokenId, TokenPool};
use tracing::{debug, info, warn};

/// Options controlling which items are iterated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCacheOptions {
    /// Only iterate items updated within this many days (0 = no limit)
    #[serde(default = "default_load_items_since")]
    pub load_items_since_days: u32,

    /// Only iterate items with at least this many distinct tokens
    #[serde(default)]
    pub min_tokens: usize,

    /// Number of cached items sampled into the random background
    #[serde(default = "default_background_sample_size")]
    pub background_sample_size: usize,
}

impl Default for ItemCacheOptions {
    fn default() -> Self {
        Self {
            load_items_since_days: default_load_items_since(),
            min_tokens: 0,
            background_sample_size: default_background_sample_size(),
        }
    }
}

fn default_load_items_since() -> u32 {
    3650
}

fn default_background_sample_size() -> usize {
    1000
}

/// Result of removing an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Entry is gone
    Removed,
    /// Entry is protected; it no longer takes part in classification but
    /// remains fetchable
    Protected,
}

/// Iteration key: most recently updated first, then ascending id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey(Reverse<DateTime<Utc>>, ItemId);

impl OrderKey {
    fn of(item: &Item) -> Self {
        OrderKey(Reverse(item.updated()), item.id())
    }
}

#[derive(Default)]
struct Index {
    items: HashMap<ItemId, Arc<Item>>,
    order: BTreeSet<OrderKey>,
    feeds: HashMap<FeedId, Feed>,
    protected: HashSet<ItemId>,
    retired: HashSet<ItemId>,
}

impl Index {
    fn remove_item(&mut self, id: ItemId) -> Option<Arc<Item>> {
        let item = self.items.remove(&id)?;
        self.order.remove(&OrderKey::of(&item));
        Some(item)
    }
}

struct Store {
    journal: Journal,
    vocabulary_loaded: bool,
}

/// State rebuilt from a full journal replay
#[derive(Default)]
struct Replayed {
    entries: HashMap<ItemId, StoredEntry>,
    feeds: HashMap<FeedId, Feed>,
    protected: HashSet<ItemId>,
    retired: HashSet<ItemId>,
    vocabulary: Vocabulary,
}

impl Replayed {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Token { id, text } => self.vocabulary.insert(id, text),
            JournalRecord::Entry(entry) => {
                self.retired.remove(&entry.id);
                self.entries.insert(entry.id, entry);
            }
            JournalRecord::RemoveEntry { id } => {
                self.entries.remove(&id);
                self.protected.remove(&id);
                self.retired.remove(&id);
            }
            JournalRecord::ProtectEntry { id } => {
                self.protected.insert(id);
            }
            JournalRecord::RetireEntry { id } => {
                self.retired.insert(id);
            }
            JournalRecord::Feed(feed) => {
                self.feeds.insert(feed.id, feed);
            }
            JournalRecord::RemoveFeed { id } => {
                self.feeds.remove(&id);
            }
        }
    }
}

fn item_from_stored(entry: &StoredEntry) -> Result<Item> {
    Item::new(entry.id, entry.updated, entry.tokens.iter().copied())
}

/// Store of items and feeds with an in-memory index
pub struct ItemCache {
    path: PathBuf,
    options: ItemCacheOptions,
    tokenizer: Tokenizer,
    store: Mutex<Store>,
    vocabulary: RwLock<Vocabulary>,
    index: RwLock<Index>,
    background: RwLock<Option<Arc<TokenPool>>>,
    loaded: AtomicBool,
    errmsg: Mutex<Option<String>>,
}

impl ItemCache {
    /// Create an empty store on disk. Never called implicitly by `create`.
    pub fn initialize(path: impl AsRef<Path>) -> Result<()> {
        journal::initialize(path.as_ref())
    }

    /// Open and validate the store at `path` without loading it
    pub fn create(path: impl AsRef<Path>, options: ItemCacheOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        journal::check_store(&path)?;
        let journal = Journal::open(&path)?;
        info!("Opened item store at {:?}", path);

        Ok(Self {
            path,
            options,
            tokenizer: Tokenizer::new()?,
            store: Mutex::new(Store {
                journal,
                vocabulary_loaded: false,
            }),
            vocabulary: RwLock::new(Vocabulary::new()),
            index: RwLock::new(Index::default()),
            background: RwLock::new(None),
            loaded: AtomicBool::new(false),
            errmsg: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ItemCacheOptions {
        &self.options
    }

    /// Populate the index from the journal. Only the first call does work.
    pub fn load(&self) -> Result<()> {
        let mut store = self.store.lock();
        if self.loaded() {
            return Ok(());
        }

        let replayed = self.replay().map_err(|e| self.fail(e))?;
        let cutoff = self.cutoff();

        let mut index = Index {
            feeds: replayed.feeds,
            protected: replayed.protected,
            retired: replayed.retired,
            ..Default::default()
        };
        for entry in replayed.entries.values() {
            match item_from_stored(entry) {
                Ok(item) => {
                    let item = Arc::new(item);
                    if self.is_iterable(&item, cutoff, &index.retired) {
                        index.order.insert(OrderKey::of(&item));
                    }
                    index.items.insert(item.id(), item);
                }
                Err(e) => warn!(item_id = entry.id, "Skipping unusable stored entry: {}", e),
            }
        }

        let background = self.sample_background(&index);
        info!(
            items = index.items.len(),
            iterable = index.order.len(),
            feeds = index.feeds.len(),
            background_tokens = background.num_tokens(),
            "Item cache loaded"
        );
        metrics::gauge!("tagstream_cached_items").set(index.order.len() as f64);

        if !store.vocabulary_loaded {
            *self.vocabulary.write() = replayed.vocabulary;
            store.vocabulary_loaded = true;
        }
        *self.index.write() = index;
        *self.background.write() = Some(Arc::new(background));
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Look up an item by id.
    ///
    /// Before `load` this falls back to scanning the journal.
    pub fn fetch_item(&self, id: ItemId) -> Option<Arc<Item>> {
        if let Some(item) = self.index.read().items.get(&id) {
            return Some(Arc::clone(item));
        }
        if self.loaded() {
            return None;
        }

        let _store = self.store.lock();
        let records = match journal::replay(&self.path) {
            Ok(records) => records,
            Err(e) => {
                self.fail(e);
                return None;
            }
        };
        let mut found: Option<StoredEntry> = None;
        for record in records {
            match record {
                JournalRecord::Entry(entry) if entry.id == id => found = Some(entry),
                JournalRecord::RemoveEntry { id: removed } if removed == id => found = None,
                _ => {}
            }
        }
        found.and_then(|entry| item_from_stored(&entry).ok().map(Arc::new))
    }

    /// Tokenize, persist and index an entry. Re-adding an id replaces it.
    pub fn add_entry(&self, entry: &Entry) -> Result<ItemId> {
        let mut words = self.tokenizer.tokenize(&entry.content);
        for (word, count) in self.tokenizer.tokenize(&entry.title) {
            *words.entry(word).or_insert(0) += count;
        }

        let mut store = self.store.lock();
        self.ensure_vocabulary(&mut store)?;

        let mut records = Vec::new();
        let mut new_words: Vec<(TokenId, String)> = Vec::new();
        let mut tokens: Vec<(TokenId, u64)> = Vec::with_capacity(words.len());
        {
            let vocabulary = self.vocabulary.read();
            let mut next_id = vocabulary.next_id();
            for (word, count) in words {
                let id = match vocabulary.id(&word) {
                    Some(id) => id,
                    None => {
                        let id = next_id;
                        next_id += 1;
                        records.push(JournalRecord::Token { id, text: word.clone() });
                        new_words.push((id, word));
                        id
                    }
                };
                tokens.push((id, count));
            }
        }
        tokens.sort_unstable();

        let item = Item::new(entry.id, entry.updated, tokens.iter().copied())?;
        records.push(JournalRecord::Entry(StoredEntry {
            id: entry.id,
            title: entry.title.clone(),
            author: entry.author.clone(),
            link: entry.link.clone(),
            updated: entry.updated,
            feed_id: entry.feed_id,
            tokens,
        }));

        store.journal.append(&records).map_err(|e| self.fail(e))?;

        {
            let mut vocabulary = self.vocabulary.write();
            for (id, word) in new_words {
                vocabulary.insert(id, word);
            }
        }

        let item = Arc::new(item);
        let cutoff = self.cutoff();
        let mut index = self.index.write();
        index.remove_item(item.id());
        index.retired.remove(&item.id());
        if self.is_iterable(&item, cutoff, &index.retired) {
            index.order.insert(OrderKey::of(&item));
        }
        index.items.insert(item.id(), Arc::clone(&item));
        drop(index);

        debug!(item_id = item.id(), tokens = item.num_tokens(), "Entry added");
        metrics::counter!("tagstream_entries_added_total").increment(1);
        Ok(item.id())
    }

    /// Remove an entry; protected entries are retired instead
    pub fn remove_entry(&self, id: ItemId) -> Result<RemoveOutcome> {
        let mut store = self.store.lock();
        let protected = self.is_protected_persisted(id)?;

        if protected {
            store
                .journal
                .append(&[JournalRecord::RetireEntry { id }])
                .map_err(|e| self.fail(e))?;
            let mut index = self.index.write();
            if let Some(item) = index.items.get(&id).cloned() {
                index.order.remove(&OrderKey::of(&item));
            }
            index.retired.insert(id);
            debug!(item_id = id, "Protected entry retired");
            return Ok(RemoveOutcome::Protected);
        }

        store
            .journal
            .append(&[JournalRecord::RemoveEntry { id }])
            .map_err(|e| self.fail(e))?;
        let mut index = self.index.write();
        index.remove_item(id);
        index.retired.remove(&id);
        debug!(item_id = id, "Entry removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Flag entries as non-deletable
    pub fn protect_items(&self, ids: &[ItemId]) -> Result<()> {
        let mut store = self.store.lock();
        let records: Vec<JournalRecord> = {
            let index = self.index.read();
            ids.iter()
                .copied()
                .filter(|id| !index.protected.contains(id))
                .collect::<HashSet<_>>()
                .into_iter()
                .map(|id| JournalRecord::ProtectEntry { id })
                .collect()
        };
        if records.is_empty() {
            return Ok(());
        }

        store.journal.append(&records).map_err(|e| self.fail(e))?;
        let mut index = self.index.write();
        for record in &records {
            if let JournalRecord::ProtectEntry { id } = record {
                index.protected.insert(*id);
            }
        }
        Ok(())
    }

    pub fn is_protected(&self, id: ItemId) -> bool {
        self.index.read().protected.contains(&id)
    }

    pub fn add_feed(&self, feed: Feed) -> Result<()> {
        let mut store = self.store.lock();
        store
            .journal
            .append(&[JournalRecord::Feed(feed.clone())])
            .map_err(|e| self.fail(e))?;
        self.index.write().feeds.insert(feed.id, feed);
        Ok(())
    }

    pub fn remove_feed(&self, id: FeedId) -> Result<()> {
        let mut store = self.store.lock();
        store
            .journal
            .append(&[JournalRecord::RemoveFeed { id }])
            .map_err(|e| self.fail(e))?;
        self.index.write().feeds.remove(&id);
        Ok(())
    }

    pub fn fetch_feed(&self, id: FeedId) -> Option<Feed> {
        self.index.read().feeds.get(&id).cloned()
    }

    pub fn num_feeds(&self) -> usize {
        self.index.read().feeds.len()
    }

    /// Visit iterable items, most recently updated first.
    ///
    /// The set of items is captured when the call starts; the lock is not
    /// held while the visitor runs. Iteration stops at the first error the
    /// visitor returns, which is passed back to the caller.
    pub fn each_item<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Item) -> Result<()>,
    {
        let snapshot: Vec<Arc<Item>> = {
            let index = self.index.read();
            index
                .order
                .iter()
                .filter_map(|key| index.items.get(&key.1).cloned())
                .collect()
        };
        for item in &snapshot {
            visitor(item)?;
        }
        Ok(())
    }

    /// Number of items `each_item` would visit
    pub fn cached_size(&self) -> usize {
        self.index.read().order.len()
    }

    /// Message of the most recent storage failure
    pub fn errmsg(&self) -> Option<String> {
        self.errmsg.lock().clone()
    }

    /// Token pool over a random sample of cached items; `None` before `load`
    pub fn random_background(&self) -> Option<Arc<TokenPool>> {
        self.background.read().clone()
    }

    /// Word for a token id
    pub fn token_text(&self, id: TokenId) -> Option<String> {
        if let Some(text) = self.vocabulary.read().text(id) {
            return Some(text.to_string());
        }
        let mut store = self.store.lock();
        if let Err(e) = self.ensure_vocabulary(&mut store) {
            warn!("Failed to load vocabulary: {}", e);
            return None;
        }
        drop(store);
        self.vocabulary.read().text(id).map(str::to_string)
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        match self.options.load_items_since_days {
            0 => None,
            days => Some(Utc::now() - Duration::days(i64::from(days))),
        }
    }

    fn is_iterable(
        &self,
        item: &Item,
        cutoff: Option<DateTime<Utc>>,
        retired: &HashSet<ItemId>,
    ) -> bool {
        if retired.contains(&item.id()) || item.num_tokens() < self.options.min_tokens {
            return false;
        }
        cutoff.map_or(true, |cutoff| item.updated() >= cutoff)
    }

    fn sample_background(&self, index: &Index) -> TokenPool {
        let candidates: Vec<&Arc<Item>> = index
            .order
            .iter()
            .filter_map(|key| index.items.get(&key.1))
            .collect();
        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, self.options.background_sample_size)
            .map(|item| Arc::as_ref(item))
            .collect()
    }

    fn is_protected_persisted(&self, id: ItemId) -> Result<bool> {
        if self.loaded() {
            return Ok(self.is_protected(id));
        }
        let records = journal::replay(&self.path).map_err(|e| self.fail(e))?;
        let mut replayed = Replayed::default();
        for record in records {
            replayed.apply(record);
        }
        Ok(replayed.protected.contains(&id) || self.is_protected(id))
    }

    fn ensure_vocabulary(&self, store: &mut Store) -> Result<()> {
        if store.vocabulary_loaded {
            return Ok(());
        }
        let records = journal::replay(&self.path).map_err(|e| self.fail(e))?;
        let mut vocabulary = Vocabulary::new();
        for record in records {
            if let JournalRecord::Token { id, text } = record {
                vocabulary.insert(id, text);
            }
        }
        debug!(tokens = vocabulary.len(), "Vocabulary loaded");
        *self.vocabulary.write() = vocabulary;
        store.vocabulary_loaded = true;
        Ok(())
    }

    fn replay(&self) -> Result<Replayed> {
        let mut replayed = Replayed::default();
        for record in journal::replay(&self.path)? {
            replayed.apply(record);
        }
        Ok(replayed)
    }

    fn fail(&self, err: Error) -> Error {
        warn!("Item cache error: {}", err);
        *self.errmsg.lock() = Some(err.to_string());
        err
    }
}
