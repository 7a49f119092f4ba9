//! Compiled template cache
//!
//! Templates are keyed by their [`TemplateId`]. Compilation is
//! single-flight per key: the map lock is only held to find or insert the
//! key's slot, and callers racing on the same key block on that slot's
//! `OnceLock` until the first caller's compile finishes. A failed compile
//! is handed to every waiter and the slot is dropped so the next call
//! tries again.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::compiler::{CompiledTemplate, compile};
use crate::error::ParseError;
use crate::parser::parse;
use crate::source::{TemplateId, TemplateSource};

type CompileResult = Result<Arc<CompiledTemplate>, ParseError>;

struct Slot {
    cell: OnceLock<CompileResult>,
    last_used: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            last_used: AtomicU64::new(0),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served by an existing or in-flight compile
    pub hits: u64,
    /// Lookups that had to compile
    pub misses: u64,
    /// Compilations performed (successful or not)
    pub compilations: u64,
    /// Entries dropped by the LRU bound
    pub evictions: u64,
    /// Entries currently cached
    pub entries: usize,
}

/// Thread-safe cache of compiled templates
pub struct TemplateCache {
    slots: Mutex<HashMap<TemplateId, Arc<Slot>>>,
    max_entries: Option<usize>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    evictions: AtomicU64,
}

impl TemplateCache {
    /// Create an unbounded cache
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a cache holding at most `max_entries` compiled templates
    /// (`None` for unbounded)
    pub fn with_capacity(max_entries: Option<usize>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_entries: max_entries.map(|n| n.max(1)),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the compiled form of `source`, parsing and compiling it on
    /// first use
    pub fn get_or_compile(&self, source: &TemplateSource) -> CompileResult {
        self.get_or_insert_with(source.id(), || {
            let fragments = parse(source)?;
            Ok(compile(source.clone(), fragments))
        })
    }

    /// Return the entry for `id`, running `build` if there is none.
    ///
    /// At most one `build` per key runs at a time; concurrent callers for
    /// the same key wait for it and share its result.
    pub fn get_or_insert_with<F>(&self, id: &TemplateId, build: F) -> CompileResult
    where
        F: FnOnce() -> Result<CompiledTemplate, ParseError>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Slot::new()))
                .clone()
        };
        slot.last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

        if let Some(result) = slot.cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(template = %id, "template cache hit");
            return result.clone();
        }

        let mut compiled_here = false;
        let result = slot
            .cell
            .get_or_init(|| {
                compiled_here = true;
                self.compilations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(template = %id, "compiling template");
                build().map(Arc::new)
            })
            .clone();

        if !compiled_here {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return result;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(_) => self.evict_if_needed(id),
            Err(error) => {
                tracing::debug!(template = %id, error = %error, "template failed to compile");
                let mut slots = self.slots.lock();
                if slots.get(id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(id);
                }
            }
        }
        result
    }

    /// Drop least-recently-used completed entries beyond the bound
    fn evict_if_needed(&self, keep: &TemplateId) {
        let Some(max_entries) = self.max_entries else {
            return;
        };
        let mut slots = self.slots.lock();
        while slots.len() > max_entries {
            let victim = slots
                .iter()
                .filter(|(id, slot)| *id != keep && slot.is_ready())
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                break;
            };
            slots.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(template = %victim, "evicted template from cache");
        }
    }

    /// Look up a completed entry without compiling
    pub fn get(&self, id: &TemplateId) -> Option<Arc<CompiledTemplate>> {
        let slots = self.slots.lock();
        match slots.get(id)?.cell.get() {
            Some(Ok(template)) => Some(template.clone()),
            _ => None,
        }
    }

    /// Remove an entry; returns whether it was present
    pub fn remove(&self, id: &TemplateId) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;
    use pretty_assertions::assert_eq;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn source(text: &str) -> TemplateSource {
        TemplateSource::new(text)
    }

    #[test]
    fn test_hit_after_miss() {
        let cache = TemplateCache::new();
        let a = cache.get_or_compile(&source("SELECT #{id}")).unwrap();
        let b = cache.get_or_compile(&source("SELECT #{id}")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.compilations), (1, 1, 1));
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_concurrent_callers_share_one_compile() {
        let cache = Arc::new(TemplateCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let id = TemplateId::Named("slow".into());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let builds = builds.clone();
                let barrier = barrier.clone();
                let id = id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_insert_with(&id, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            let source = TemplateSource::with_id("slow", "SELECT 1");
                            let fragments = parse(&source)?;
                            Ok(compile(source, fragments))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(cache.stats().compilations, 1);
    }

    #[test]
    fn test_failed_compile_is_retried() {
        let cache = TemplateCache::new();
        let broken = source("<if test=\"a\">x");

        let err = cache.get_or_compile(&broken).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedTag { tag: "if".into() });
        assert!(cache.is_empty());

        assert!(cache.get_or_compile(&broken).is_err());
        assert_eq!(cache.stats().compilations, 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TemplateCache::with_capacity(Some(2));
        let a = source("SELECT 'a'");
        let b = source("SELECT 'b'");
        let c = source("SELECT 'c'");

        cache.get_or_compile(&a).unwrap();
        cache.get_or_compile(&b).unwrap();
        // touch `a` so `b` becomes least recently used
        cache.get_or_compile(&a).unwrap();
        cache.get_or_compile(&c).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(a.id()).is_some());
        assert!(cache.get(b.id()).is_none());
        assert!(cache.get(c.id()).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = TemplateCache::new();
        let a = source("SELECT 1");
        cache.get_or_compile(&a).unwrap();
        assert!(cache.remove(a.id()));
        assert!(!cache.remove(a.id()));

        cache.get_or_compile(&a).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
