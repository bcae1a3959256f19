//! Bounded, single-flight prepared-statement cache. Keyed by
//! `(HostId, keyspace, statement text)` since a PREPARE's statement id is
//! only meaningful against the connection's current keyspace and the
//! specific host that returned it (ids aren't guaranteed portable across
//! hosts by the protocol, even though many servers do make them so).

use crate::host::HostId;
use crate::metadata::PreparedMetadata;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host_id: HostId,
    pub keyspace: Arc<str>,
    pub statement_text: Arc<str>,
}

/// What a PREPARE in flight resolves to. `watch` rather than `Notify`:
/// a receiver created via `sender.subscribe()` always sees whatever value
/// is current the moment it first checks, even if the sender already sent
/// before the receiver existed, so a waiter can never miss the wakeup by
/// subscribing a moment too late.
type PrepareResult = Result<Arc<PreparedMetadata>, String>;

enum Entry {
    Preparing(watch::Sender<Option<PrepareResult>>),
    Prepared(Arc<PreparedMetadata>),
    /// A terminal failure, kept around briefly so concurrent callers who
    /// arrived mid-flight get the same error instead of each retrying the
    /// PREPARE themselves; cleared on the next `invalidate`/`prepare` call
    /// for this key.
    Failed(String),
}

/// An LRU-bounded map from `CacheKey` to prepared-statement metadata, with
/// single-flight PREPARE coordination: concurrent callers for the same key
/// while a PREPARE is in flight wait on the same result rather than each
/// issuing their own PREPARE frame.
pub struct PreparedCache {
    inner: std::sync::Mutex<lru::LruCache<CacheKey, Entry>>,
}

pub enum PrepareOutcome {
    /// Caller must perform the PREPARE itself and call
    /// [`PreparedCache::complete`]/[`PreparedCache::fail`] when done.
    MustPrepare,
    /// Another caller is already preparing this statement; await this
    /// receiver reaching `Some` and use its latched value directly.
    Await(watch::Receiver<Option<PrepareResult>>),
    Ready(Arc<PreparedMetadata>),
}

impl PreparedCache {
    pub fn new(capacity: usize) -> PreparedCache {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        PreparedCache {
            inner: std::sync::Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    /// Looks up `key`, claiming single-flight ownership if nobody else is
    /// preparing it yet.
    pub fn get_or_claim(&self, key: &CacheKey) -> PrepareOutcome {
        let mut guard = self.inner.lock().unwrap();
        match guard.get(key) {
            Some(Entry::Prepared(meta)) => PrepareOutcome::Ready(meta.clone()),
            Some(Entry::Preparing(sender)) => PrepareOutcome::Await(sender.subscribe()),
            Some(Entry::Failed(_)) | None => {
                let (sender, _) = watch::channel(None);
                guard.put(key.clone(), Entry::Preparing(sender));
                PrepareOutcome::MustPrepare
            }
        }
    }

    pub fn complete(&self, key: &CacheKey, metadata: Arc<PreparedMetadata>) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(Entry::Preparing(sender)) = guard.peek(key) {
            sender.send_replace(Some(Ok(metadata.clone())));
        }
        guard.put(key.clone(), Entry::Prepared(metadata));
    }

    pub fn fail(&self, key: &CacheKey, message: String) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(Entry::Preparing(sender)) = guard.peek(key) {
            sender.send_replace(Some(Err(message.clone())));
        }
        guard.put(key.clone(), Entry::Failed(message));
    }

    /// Drops a cached entry after the server reports `UNPREPARED` for its
    /// statement id, forcing the next execution to re-PREPARE.
    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.lock().unwrap().pop(key);
    }

    /// Updates an already-cached entry's result metadata in place after a
    /// protocol v5 `Metadata_changed` flag, without disturbing
    /// its LRU position or forcing callers to re-PREPARE.
    pub fn update_result_metadata(&self, key: &CacheKey, metadata: Arc<PreparedMetadata>) {
        let mut guard = self.inner.lock().unwrap();
        if guard.peek(key).is_some() {
            guard.put(key.clone(), Entry::Prepared(metadata));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;
    use crate::host::HostId;

    fn key() -> CacheKey {
        CacheKey {
            host_id: HostId(Uuid::from_u128(1)),
            keyspace: "ks".into(),
            statement_text: "select 1".into(),
        }
    }

    fn meta() -> Arc<PreparedMetadata> {
        Arc::new(PreparedMetadata {
            statement_id: Bytes::from_static(b"id"),
            result_metadata_id: None,
            bind_columns: Vec::new(),
            result_columns: Vec::new(),
            pk_indices: Vec::new(),
        })
    }

    #[test]
    fn first_caller_must_prepare_second_awaits() {
        let cache = PreparedCache::new(10);
        let k = key();
        assert!(matches!(cache.get_or_claim(&k), PrepareOutcome::MustPrepare));
        assert!(matches!(cache.get_or_claim(&k), PrepareOutcome::Await(_)));
    }

    #[test]
    fn complete_makes_entry_ready_for_new_callers() {
        let cache = PreparedCache::new(10);
        let k = key();
        let _ = cache.get_or_claim(&k);
        cache.complete(&k, meta());
        assert!(matches!(cache.get_or_claim(&k), PrepareOutcome::Ready(_)));
    }

    #[test]
    fn invalidate_forces_reprepare() {
        let cache = PreparedCache::new(10);
        let k = key();
        let _ = cache.get_or_claim(&k);
        cache.complete(&k, meta());
        cache.invalidate(&k);
        assert!(matches!(cache.get_or_claim(&k), PrepareOutcome::MustPrepare));
    }

    #[test]
    fn bounded_capacity_evicts_lru() {
        let cache = PreparedCache::new(1);
        let k1 = key();
        let k2 = CacheKey {
            host_id: HostId(Uuid::from_u128(1)),
            keyspace: "ks".into(),
            statement_text: "select 2".into(),
        };
        cache.complete(&k1, meta());
        cache.complete(&k2, meta());
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.get_or_claim(&k1), PrepareOutcome::MustPrepare));
    }
}
