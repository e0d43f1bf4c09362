//! Cache mirror: a best-effort copy of conversation and client state.
//!
//! The mirror lets a reconnecting session resume its transient client status
//! and lets offline delivery act without a live session. It is never
//! authoritative; the durable store is. [`MemoryCache`] bounds growth with a
//! TTL per entry and LRU eviction at capacity.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::client::ClientState;
use parley_core::conversation::{Conversation, Message, PromptData};
use parley_core::ids::ConversationId;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// What the mirror keeps per conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Conversation snapshot.
    pub conversation: Conversation,
    /// Transient client/server status.
    pub client: ClientState,
}

/// Best-effort mirror keyed by conversation identity.
#[async_trait]
pub trait CacheMirror: Send + Sync {
    /// Current entry, if present and not expired.
    async fn get(&self, id: &ConversationId) -> Result<Option<CacheEntry>>;

    /// Store the conversation snapshot, keeping any cached client state.
    async fn put_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Replace the client state of an existing entry.
    async fn put_client_state(&self, id: &ConversationId, client: &ClientState) -> Result<()>;

    /// Replace the prompt bookkeeping of an existing entry.
    async fn put_prompt_data(&self, id: &ConversationId, prompt_data: &PromptData) -> Result<()>;

    /// Append a message to an existing entry.
    async fn append_message(&self, id: &ConversationId, message: &Message) -> Result<()>;

    /// Drop an entry.
    async fn remove(&self, id: &ConversationId) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Bounds for [`MemoryCache`].
#[derive(Clone, Debug)]
pub struct MemoryCacheConfig {
    /// Entry time-to-live, refreshed on every write.
    pub ttl: Duration,
    /// Entries kept before the least recently used one is evicted.
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    expires_at: Instant,
    last_used: u64,
}

/// Slots plus their recency order: `access_order` maps a monotonically
/// increasing use tick to the key last used at that tick.
#[derive(Default)]
struct Inner {
    slots: HashMap<ConversationId, Slot>,
    access_order: BTreeMap<u64, ConversationId>,
    clock: u64,
}

impl Inner {
    fn touch(&mut self, id: &ConversationId) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(slot) = self.slots.get_mut(id) {
            let _ = self.access_order.remove(&slot.last_used);
            slot.last_used = tick;
            let _ = self.access_order.insert(tick, id.clone());
        }
    }

    fn insert(&mut self, id: ConversationId, slot: Slot) {
        self.forget(&id);
        drop(self.slots.insert(id.clone(), slot));
        self.touch(&id);
    }

    fn forget(&mut self, id: &ConversationId) {
        if let Some(slot) = self.slots.remove(id) {
            let _ = self.access_order.remove(&slot.last_used);
        }
    }

    fn live_mut(&mut self, id: &ConversationId, now: Instant) -> Option<&mut Slot> {
        if self.slots.get(id).is_some_and(|s| now >= s.expires_at) {
            self.forget(id);
            return None;
        }
        self.slots.get_mut(id)
    }

    fn evict_one(&mut self) {
        if let Some((_, oldest)) = self.access_order.pop_first() {
            drop(self.slots.remove(&oldest));
        }
    }
}

/// Snapshot of cache counters.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheStats {
    /// Entries currently held (expired ones included until touched).
    pub size: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
}

/// In-process LRU + TTL [`CacheMirror`].
pub struct MemoryCache {
    inner: Mutex<Inner>,
    config: MemoryCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.inner.lock().slots.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn update<F>(&self, id: &ConversationId, f: F) -> Result<()>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(slot) = inner.live_mut(id, now) else {
            return Err(StoreError::CacheMiss(id.to_string()));
        };
        f(&mut slot.entry);
        slot.expires_at = now + self.config.ttl;
        inner.touch(id);
        Ok(())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl CacheMirror for MemoryCache {
    async fn get(&self, id: &ConversationId) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.lock();
        let found = inner.live_mut(id, Instant::now()).map(|s| s.entry.clone());
        if found.is_some() {
            inner.touch(id);
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let id = conversation.id.clone();
        let client = inner
            .live_mut(&id, now)
            .map(|s| s.entry.client.clone())
            .unwrap_or_default();

        if !inner.slots.contains_key(&id) {
            while !inner.slots.is_empty() && inner.slots.len() >= self.config.max_entries {
                inner.evict_one();
            }
        }
        let slot = Slot {
            entry: CacheEntry {
                conversation: conversation.clone(),
                client,
            },
            expires_at: now + self.config.ttl,
            last_used: 0,
        };
        inner.insert(id, slot);
        Ok(())
    }

    async fn put_client_state(&self, id: &ConversationId, client: &ClientState) -> Result<()> {
        self.update(id, |entry| entry.client = client.clone())
    }

    async fn put_prompt_data(&self, id: &ConversationId, prompt_data: &PromptData) -> Result<()> {
        self.update(id, |entry| entry.conversation.prompt_data = prompt_data.clone())
    }

    async fn append_message(&self, id: &ConversationId, message: &Message) -> Result<()> {
        self.update(id, |entry| entry.conversation.messages.push(message.clone()))
    }

    async fn remove(&self, id: &ConversationId) -> Result<()> {
        self.inner.lock().forget(id);
        Ok(())
    }
}
