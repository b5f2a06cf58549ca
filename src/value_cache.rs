//! value_cache is a concurrent key/value cache with TTLs, LRU eviction under
//! entry- and byte-bounds, a background sweeper, and optional per-scope
//! envelope encryption.
//!
//! Independent subsystem: it shares only the AES-GCM/HKDF primitives with
//! the database engine.  The cache owns its buffers; readers always receive
//! a fresh copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::crypto;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Entry of {size} bytes exceeds the cache's {max}-byte bound.")]
    EntryTooLarge { size: usize, max: usize },
    #[error("Entry failed authentication; it was stored under a different key or tampered with.")]
    Integrity,
    #[error("Entitlement is enabled but no scope is available for this operation.")]
    ScopeMissing,
}

impl From<crypto::Error> for Error {
    fn from(_: crypto::Error) -> Error {
        Error::Integrity
    }
}

/// Supplies the caller's current scope when entitlement is enabled.
pub trait EntitlementProvider: Send + Sync {
    fn current_scope(&self) -> Option<String>;
}

/// A fixed scope, for single-tenant setups and tests.
pub struct StaticScope(pub String);

impl EntitlementProvider for StaticScope {
    fn current_scope(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[derive(Clone, Default)]
pub struct CacheConfig {
    pub max_entries: Option<usize>,
    pub max_bytes: Option<usize>,
    /// Zero disables the background sweeper; `sweep_expired` stays manual.
    pub sweep_interval: Duration,
    pub default_absolute_ttl: Option<Duration>,
    pub default_sliding_ttl: Option<Duration>,
    pub entitlement_enabled: bool,
    /// Master key for envelope encryption; required when entitlement is on
    /// and values should be sealed per scope.
    pub master_key: Option<Vec<u8>>,
    pub entitlement_provider: Option<Arc<dyn EntitlementProvider>>,
}

/// Per-entry overrides.
#[derive(Clone, Default)]
pub struct EntryOptions {
    pub absolute_expiration: Option<Instant>,
    pub absolute_expiration_relative_to_now: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Entry {
    /// Plaintext, or nonce ‖ ciphertext ‖ tag when sealed.
    bytes: Vec<u8>,
    absolute_deadline: Option<Instant>,
    sliding_window: Option<Duration>,
    sliding_deadline: Option<Instant>,
    scope: Option<String>,
    sealed: bool,
}

impl Entry {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn expired(&self, now: Instant) -> bool {
        self.absolute_deadline.is_some_and(|d| d <= now)
            || self.sliding_deadline.is_some_and(|d| d <= now)
    }

    fn touch(&mut self, now: Instant) {
        if let Some(window) = self.sliding_window {
            self.sliding_deadline = Some(now + window);
        }
    }
}

struct State {
    lru: LruCache<String, Entry>,
    total_bytes: usize,
    stats: CacheStats,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    sweeper_signal: Condvar,
    config: CacheConfig,
    scope_keys: Mutex<HashMap<String, [u8; crypto::KEY_LEN]>>,
}

/// The concurrent value cache.
pub struct ValueCache {
    shared: Arc<Shared>,
    sweeper: Option<std::thread::JoinHandle<()>>,
}

const SCOPE_KEY_INFO_PREFIX: &str = "sharc-cache-scope/";

impl Shared {
    fn scope_key(&self, scope: &str) -> [u8; crypto::KEY_LEN] {
        let mut keys = self.scope_keys.lock();
        if let Some(k) = keys.get(scope) {
            return *k;
        }
        let master = self
            .config
            .master_key
            .as_ref()
            .expect("sealing requires a master key");
        let info = format!("{SCOPE_KEY_INFO_PREFIX}{scope}");
        let k = crypto::derive_key(master, &info);
        keys.insert(scope.to_string(), k);
        k
    }

    fn seals(&self) -> bool {
        self.config.entitlement_enabled && self.config.master_key.is_some()
    }

    fn provider_scope(&self) -> Option<String> {
        self.config
            .entitlement_provider
            .as_ref()
            .and_then(|p| p.current_scope())
    }

    /// Drop expired entries.  Called under no lock; takes it itself.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .lru
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            if let Some(e) = state.lru.pop(&key) {
                state.total_bytes -= e.size();
                state.stats.expirations += 1;
            }
        }
        if count > 0 {
            trace!("swept {count} expired entries");
        }
        count
    }
}

impl ValueCache {
    pub fn new(config: CacheConfig) -> ValueCache {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                lru: LruCache::unbounded(),
                total_bytes: 0,
                stats: CacheStats::default(),
                closed: false,
            }),
            sweeper_signal: Condvar::new(),
            config,
            scope_keys: Mutex::new(HashMap::new()),
        });
        let sweeper = if shared.config.sweep_interval > Duration::ZERO {
            let interval = shared.config.sweep_interval;
            let shared2 = Arc::clone(&shared);
            Some(std::thread::spawn(move || loop {
                {
                    let mut state = shared2.state.lock();
                    if state.closed {
                        return;
                    }
                    let timeout = shared2.sweeper_signal.wait_for(&mut state, interval);
                    if state.closed {
                        return;
                    }
                    if !timeout.timed_out() {
                        continue; // spurious wake or config poke
                    }
                }
                shared2.sweep();
            }))
        } else {
            None
        };
        ValueCache { shared, sweeper }
    }

    fn resolve_scope(&self, explicit: &Option<String>) -> Result<Option<String>, Error> {
        let scope = explicit.clone().or_else(|| self.shared.provider_scope());
        if self.shared.config.entitlement_enabled && scope.is_none() {
            return Err(Error::ScopeMissing);
        }
        Ok(scope)
    }

    fn build_entry(
        &self,
        value: &[u8],
        opts: &EntryOptions,
        now: Instant,
    ) -> Result<Entry, Error> {
        let scope = self.resolve_scope(&opts.scope)?;
        let (bytes, sealed) = if self.shared.seals() {
            let scope_name = scope.as_deref().ok_or(Error::ScopeMissing)?;
            let key = self.shared.scope_key(scope_name);
            let nonce = crypto::random_nonce();
            let ct = crypto::seal(&key, &nonce, scope_name.as_bytes(), value);
            let mut bytes = Vec::with_capacity(crypto::NONCE_LEN + ct.len());
            bytes.extend_from_slice(&nonce);
            bytes.extend_from_slice(&ct);
            (bytes, true)
        } else {
            (value.to_vec(), false)
        };

        let config = &self.shared.config;
        let absolute_deadline = opts
            .absolute_expiration
            .or_else(|| opts.absolute_expiration_relative_to_now.map(|d| now + d))
            .or_else(|| config.default_absolute_ttl.map(|d| now + d));
        let sliding_window = opts.sliding_expiration.or(config.default_sliding_ttl);
        Ok(Entry {
            bytes,
            absolute_deadline,
            sliding_window,
            sliding_deadline: sliding_window.map(|w| now + w),
            scope,
            sealed,
        })
    }

    /// Store a value under `key` with per-entry options.
    pub fn set_with(&self, key: &str, value: &[u8], opts: &EntryOptions) -> Result<(), Error> {
        let now = Instant::now();
        let entry = self.build_entry(value, opts, now)?;
        if let Some(max) = self.shared.config.max_bytes {
            if entry.size() > max {
                return Err(Error::EntryTooLarge {
                    size: entry.size(),
                    max,
                });
            }
        }
        let mut state = self.shared.state.lock();
        if let Some(old) = state.lru.pop(key) {
            state.total_bytes -= old.size();
        }
        state.total_bytes += entry.size();
        state.lru.put(key.to_string(), entry);
        Self::evict_to_bounds(&self.shared.config, &mut state);
        Ok(())
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.set_with(key, value, &EntryOptions::default())
    }

    fn evict_to_bounds(config: &CacheConfig, state: &mut State) {
        loop {
            let over_entries = config
                .max_entries
                .is_some_and(|m| state.lru.len() > m);
            let over_bytes = config.max_bytes.is_some_and(|m| state.total_bytes > m);
            if !(over_entries || over_bytes) || state.lru.is_empty() {
                return;
            }
            if let Some((key, e)) = state.lru.pop_lru() {
                state.total_bytes -= e.size();
                state.stats.evictions += 1;
                debug!("evicted {key} ({} bytes)", e.size());
            }
        }
    }

    /// Fetch a copy of the value.  Expired, missing and wrong-scope keys all
    /// read as `None`; only authentication failures error.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let now = Instant::now();
        let caller_scope = if self.shared.config.entitlement_enabled {
            self.shared.provider_scope()
        } else {
            None
        };
        #[derive(Clone, Copy, PartialEq)]
        enum Peek {
            Missing,
            Expired,
            WrongScope,
            Live,
        }
        let (bytes, sealed, scope) = {
            let mut state = self.shared.state.lock();
            let verdict = match state.lru.peek(key) {
                None => Peek::Missing,
                Some(e) if e.expired(now) => Peek::Expired,
                Some(e) if self.shared.config.entitlement_enabled && e.scope != caller_scope => {
                    // Indistinguishable from absence.
                    Peek::WrongScope
                }
                Some(_) => Peek::Live,
            };
            match verdict {
                Peek::Missing | Peek::WrongScope => {
                    state.stats.misses += 1;
                    return Ok(None);
                }
                Peek::Expired => {
                    if let Some(e) = state.lru.pop(key) {
                        state.total_bytes -= e.size();
                        state.stats.expirations += 1;
                    }
                    state.stats.misses += 1;
                    return Ok(None);
                }
                Peek::Live => {}
            }
            let e = state.lru.get_mut(key).expect("verdict was Live");
            e.touch(now);
            state.stats.hits += 1;
            let e = state.lru.peek(key).expect("verdict was Live");
            (e.bytes.clone(), e.sealed, e.scope.clone())
        };
        if !sealed {
            return Ok(Some(bytes));
        }
        let scope_name = scope.ok_or(Error::ScopeMissing)?;
        let key_material = self.shared.scope_key(&scope_name);
        if bytes.len() < crypto::NONCE_LEN {
            return Err(Error::Integrity);
        }
        let mut nonce = [0u8; crypto::NONCE_LEN];
        nonce.copy_from_slice(&bytes[..crypto::NONCE_LEN]);
        let plain = crypto::open(
            &key_material,
            &nonce,
            scope_name.as_bytes(),
            &bytes[crypto::NONCE_LEN..],
        )?;
        Ok(Some(plain))
    }

    /// Remove a key; true when it was present (expired or not).
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.shared.state.lock();
        match state.lru.pop(key) {
            Some(e) => {
                state.total_bytes -= e.size();
                true
            }
            None => false,
        }
    }

    /// Store several values under one lock acquisition.
    pub fn set_many<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
        opts: &EntryOptions,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let mut built = Vec::new();
        for (key, value) in entries {
            let entry = self.build_entry(value, opts, now)?;
            if let Some(max) = self.shared.config.max_bytes {
                if entry.size() > max {
                    return Err(Error::EntryTooLarge {
                        size: entry.size(),
                        max,
                    });
                }
            }
            built.push((key.to_string(), entry));
        }
        let mut state = self.shared.state.lock();
        for (key, entry) in built {
            if let Some(old) = state.lru.pop(&key) {
                state.total_bytes -= old.size();
            }
            state.total_bytes += entry.size();
            state.lru.put(key, entry);
            Self::evict_to_bounds(&self.shared.config, &mut state);
        }
        Ok(())
    }

    /// Fetch several keys; absent/expired/wrong-scope keys are simply not in
    /// the result.
    pub fn get_many<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashMap<String, Vec<u8>>, Error> {
        let mut out = HashMap::new();
        for key in keys {
            if let Some(v) = self.get(key)? {
                out.insert(key.to_string(), v);
            }
        }
        Ok(out)
    }

    /// Remove several keys, returning how many were present.
    pub fn remove_many<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut state = self.shared.state.lock();
        let mut count = 0;
        for key in keys {
            if let Some(e) = state.lru.pop(key) {
                state.total_bytes -= e.size();
                count += 1;
            }
        }
        count
    }

    /// Drop expired entries now; returns how many went.
    pub fn sweep_expired(&self) -> usize {
        self.shared.sweep()
    }

    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.lru.clear();
        state.total_bytes = 0;
    }

    pub fn entry_count(&self) -> usize {
        self.shared.state.lock().lru.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.shared.state.lock().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().stats
    }

    /// Stop the sweeper and run one final sweep.  Idempotent; also invoked
    /// by `Drop`.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.sweeper_signal.notify_all();
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
        self.shared.sweep();
    }
}

impl Drop for ValueCache {
    fn drop(&mut self) {
        self.close();
    }
}
