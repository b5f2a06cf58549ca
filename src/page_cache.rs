//! A capacity-bounded LRU cache over a [`PageSource`], with an optional
//! sequential-access detector that prefetches ahead of forward scans.
//!
//! Cached spans are refcounted, so evicting an entry never invalidates a span
//! a cursor is still holding; the entry just leaves the index and the bytes
//! are freed when the last holder drops.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::trace;
use lru::LruCache;
use parking_lot::Mutex;

use crate::pager::{Error, Page, PageNum, PageSource};

/// Sequential-prefetch tuning.  When the last `sequential_threshold` requests
/// are consecutive ascending page numbers, up to `depth` following pages are
/// pulled into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchConfig {
    pub sequential_threshold: usize,
    pub depth: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            sequential_threshold: 3,
            depth: 8,
        }
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub prefetched: u64,
}

struct CacheState {
    lru: LruCache<PageNum, Page>,
    /// Ring of the most recent distinct requests, newest at the back.
    recent: VecDeque<PageNum>,
    stats: CacheStats,
}

/// LRU page cache wrapping a slower source.
pub struct PageCache {
    inner: Arc<dyn PageSource>,
    state: Mutex<CacheState>,
    prefetch: Option<PrefetchConfig>,
}

impl PageCache {
    /// `capacity` must be non-zero; callers that want caching off simply
    /// don't wrap the source.
    pub fn new(
        inner: Arc<dyn PageSource>,
        capacity: usize,
        prefetch: Option<PrefetchConfig>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        let ring_len = prefetch
            .map(|p| p.sequential_threshold)
            .unwrap_or(0)
            .max(1);
        PageCache {
            inner,
            state: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                recent: VecDeque::with_capacity(ring_len),
                stats: CacheStats::default(),
            }),
            prefetch,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Drop every cached page.  The owning database calls this after a
    /// commit, whose pages make the cached copies stale.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.recent.clear();
    }

    /// True if `pn` is resident without touching recency or counters.
    pub fn contains(&self, pn: PageNum) -> bool {
        self.state.lock().lru.peek(&pn).is_some()
    }

    fn note_request(state: &mut CacheState, pn: PageNum, ring_len: usize) {
        if state.recent.back() == Some(&pn) {
            return; // re-reads of the current page don't advance the window
        }
        if state.recent.len() == ring_len {
            state.recent.pop_front();
        }
        state.recent.push_back(pn);
    }

    /// Detect a strictly-ascending run filling the ring.
    fn sequential_run(state: &CacheState, threshold: usize) -> Option<PageNum> {
        if threshold == 0 || state.recent.len() < threshold {
            return None;
        }
        let mut iter = state.recent.iter().rev();
        let last = *iter.next().unwrap();
        let mut expect = last;
        for _ in 1..threshold {
            expect = expect.checked_sub(1)?;
            if *iter.next().unwrap() != expect {
                return None;
            }
        }
        Some(last)
    }

    /// Best-effort fill of the window after `last`.  Failures (end of file,
    /// I/O) are swallowed; prefetch is advisory.
    fn prefetch_after(&self, last: PageNum, served: PageNum, cfg: PrefetchConfig) {
        let count = self.inner.page_count();
        let end = last.saturating_add(cfg.depth).min(count);
        for pn in (last + 1)..=end {
            {
                let state = self.state.lock();
                if state.lru.peek(&pn).is_some() {
                    continue;
                }
            }
            match self.inner.page(pn) {
                Ok(page) => {
                    let mut state = self.state.lock();
                    state.lru.put(pn, page);
                    state.stats.prefetched += 1;
                    // Keep the page being served the most recent entry so the
                    // prefetch window cannot push it out.
                    state.lru.promote(&served);
                }
                Err(e) => {
                    trace!("prefetch of page {} skipped: {}", pn, e);
                    break;
                }
            }
        }
    }
}

impl PageSource for PageCache {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn page_count(&self) -> u32 {
        self.inner.page_count()
    }

    fn page(&self, pn: PageNum) -> Result<Page, Error> {
        let ring_len = self
            .prefetch
            .map(|p| p.sequential_threshold)
            .unwrap_or(0)
            .max(1);

        let (hit, run) = {
            let mut state = self.state.lock();
            Self::note_request(&mut state, pn, ring_len);
            let hit = state.lru.get(&pn).cloned();
            if hit.is_some() {
                state.stats.hits += 1;
            } else {
                state.stats.misses += 1;
            }
            let run = self
                .prefetch
                .and_then(|cfg| Self::sequential_run(&state, cfg.sequential_threshold));
            (hit, run)
        };

        let page = match hit {
            Some(page) => page,
            None => {
                // Fetch outside the lock so readers of other pages proceed.
                let page = self.inner.page(pn)?;
                let mut state = self.state.lock();
                state.lru.put(pn, page.clone());
                page
            }
        };

        if let (Some(cfg), Some(last)) = (self.prefetch, run) {
            self.prefetch_after(last, pn, cfg);
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemPager;

    fn source(pages: u32) -> Arc<dyn PageSource> {
        let mut image = vec![0u8; (pages * 128) as usize];
        for p in 0..pages {
            image[(p * 128) as usize] = p as u8 + 1;
        }
        Arc::new(MemPager::from_bytes(&image, 128))
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = PageCache::new(source(4), 2, None);
        cache.page(1).unwrap();
        cache.page(1).unwrap();
        cache.page(2).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = PageCache::new(source(4), 2, None);
        cache.page(1).unwrap();
        cache.page(2).unwrap();
        cache.page(1).unwrap(); // promote 1; victim is now 2
        cache.page(3).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_evicted_span_stays_valid() {
        let cache = PageCache::new(source(4), 1, None);
        let held = cache.page(1).unwrap();
        cache.page(2).unwrap(); // evicts entry for page 1
        assert!(!cache.contains(1));
        assert_eq!(held[0], 1); // span still readable
    }

    #[test]
    fn test_sequential_scan_prefetches() {
        let cfg = PrefetchConfig {
            sequential_threshold: 3,
            depth: 4,
        };
        let cache = PageCache::new(source(16), 16, Some(cfg));
        cache.page(1).unwrap();
        cache.page(2).unwrap();
        assert_eq!(cache.stats().prefetched, 0);
        cache.page(3).unwrap(); // completes the ascending run
        assert_eq!(cache.stats().prefetched, 4);
        assert!(cache.contains(4));
        assert!(cache.contains(7));
        assert!(!cache.contains(8));
    }

    #[test]
    fn test_random_access_does_not_prefetch() {
        let cfg = PrefetchConfig::default();
        let cache = PageCache::new(source(16), 16, Some(cfg));
        for pn in [5, 2, 9, 4, 11, 3] {
            cache.page(pn).unwrap();
        }
        assert_eq!(cache.stats().prefetched, 0);
    }

    #[test]
    fn test_prefetch_stops_at_end_of_file() {
        let cfg = PrefetchConfig {
            sequential_threshold: 2,
            depth: 8,
        };
        let cache = PageCache::new(source(4), 16, Some(cfg));
        cache.page(2).unwrap();
        cache.page(3).unwrap(); // run detected; only page 4 exists beyond
        assert_eq!(cache.stats().prefetched, 1);
        assert!(cache.contains(4));
    }
}
