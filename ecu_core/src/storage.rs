//! Message-driven key/value storage with a write-back cache.
//!
//! Components persist floats by publishing SAVE_FLOAT / LOAD_FLOAT
//! payloads; the manager answers on the response ids. A small cache sits
//! in front of the backend: saves mark entries dirty (write-through when
//! the priority flag is set), loads hit the cache first, and eviction
//! flushes dirty entries before reuse. String keys hash through
//! CRC-16 into the storage subsystem's 29-bit key space.

pub mod backend;

use std::cell::RefCell;
use std::rc::Rc;

use ecu_common::consts::STORAGE_CACHE_SIZE;
use ecu_common::msg::{
    CanMessage, ECU_BASE_PRIMARY, MSG_STORAGE_COMMIT_CACHE, MSG_STORAGE_LOAD_FLOAT,
    MSG_STORAGE_LOAD_RESPONSE, MSG_STORAGE_SAVE_FLOAT, MSG_STORAGE_SAVE_RESPONSE,
    MSG_STORAGE_STATS_REQUEST, MSG_STORAGE_STATS_RESPONSE, SUBSYS_STORAGE, make_msg_id,
};
use tracing::debug;

use crate::bus::{MessageBus, handler};
use self::backend::{StorageBackend, crc16};

/// Dirty entries older than this are flushed opportunistically.
const DIRTY_FLUSH_MS: u32 = 5000;

/// Hash a string key into the 16-bit storage key space.
pub fn key_hash(key: &str) -> u16 {
    crc16(key.as_bytes())
}

/// Backend key for a hashed string key.
pub fn storage_key(key_hash: u16) -> u32 {
    make_msg_id(ECU_BASE_PRIMARY, SUBSYS_STORAGE, key_hash)
}

// ─── Wire payloads ──────────────────────────────────────────────────

/// SAVE_FLOAT payload: key hash, value, sender, priority flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaveFloatMsg {
    pub key_hash: u16,
    pub value: f32,
    pub sender_id: u8,
    /// Non-zero commits to the backend immediately.
    pub priority: u8,
}

impl SaveFloatMsg {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.key_hash.to_le_bytes());
        out[2..6].copy_from_slice(&self.value.to_le_bytes());
        out[6] = self.sender_id;
        out[7] = self.priority;
        out
    }

    pub fn from_msg(msg: &CanMessage) -> Option<Self> {
        if msg.len != 8 {
            return None;
        }
        let mut v = [0u8; 4];
        v.copy_from_slice(&msg.buf[2..6]);
        Some(Self {
            key_hash: u16::from_le_bytes([msg.buf[0], msg.buf[1]]),
            value: f32::from_le_bytes(v),
            sender_id: msg.buf[6],
            priority: msg.buf[7],
        })
    }
}

/// LOAD_FLOAT payload: key hash, default value, sender, request id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadFloatMsg {
    pub key_hash: u16,
    pub default_value: f32,
    pub sender_id: u8,
    pub request_id: u8,
}

impl LoadFloatMsg {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.key_hash.to_le_bytes());
        out[2..6].copy_from_slice(&self.default_value.to_le_bytes());
        out[6] = self.sender_id;
        out[7] = self.request_id;
        out
    }

    pub fn from_msg(msg: &CanMessage) -> Option<Self> {
        if msg.len != 8 {
            return None;
        }
        let mut v = [0u8; 4];
        v.copy_from_slice(&msg.buf[2..6]);
        Some(Self {
            key_hash: u16::from_le_bytes([msg.buf[0], msg.buf[1]]),
            default_value: f32::from_le_bytes(v),
            sender_id: msg.buf[6],
            request_id: msg.buf[7],
        })
    }
}

/// LOAD_RESPONSE payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadResponseMsg {
    pub key_hash: u16,
    pub value: f32,
    pub success: bool,
    pub request_id: u8,
}

impl LoadResponseMsg {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.key_hash.to_le_bytes());
        out[2..6].copy_from_slice(&self.value.to_le_bytes());
        out[6] = self.success as u8;
        out[7] = self.request_id;
        out
    }

    pub fn from_msg(msg: &CanMessage) -> Option<Self> {
        if msg.len != 8 {
            return None;
        }
        let mut v = [0u8; 4];
        v.copy_from_slice(&msg.buf[2..6]);
        Some(Self {
            key_hash: u16::from_le_bytes([msg.buf[0], msg.buf[1]]),
            value: f32::from_le_bytes(v),
            success: msg.buf[6] != 0,
            request_id: msg.buf[7],
        })
    }
}

/// Storage statistics counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StorageStats {
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub disk_writes: u32,
    pub disk_reads: u32,
}

// ─── Cache ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    key_hash: u16,
    value: f32,
    last_access_ms: u32,
    dirty: bool,
    dirty_since_ms: u32,
    access_count: u8,
}

struct StorageInner {
    backend: Box<dyn StorageBackend>,
    cache: heapless::Vec<CacheEntry, STORAGE_CACHE_SIZE>,
    stats: StorageStats,
}

impl StorageInner {
    fn flush_entry(&mut self, index: usize) -> bool {
        let entry = self.cache[index];
        if !entry.dirty {
            return true;
        }
        let ok = self
            .backend
            .write_data(storage_key(entry.key_hash), &entry.value.to_le_bytes());
        if ok {
            self.cache[index].dirty = false;
            self.stats.disk_writes += 1;
        }
        ok
    }

    /// Insert or update a cache entry, evicting the oldest access when
    /// the table is full (dirty victims are flushed first).
    fn put(&mut self, key_hash: u16, value: f32, dirty: bool, now_ms: u32) {
        if let Some(index) = self.cache.iter().position(|e| e.key_hash == key_hash) {
            let entry = &mut self.cache[index];
            entry.value = value;
            entry.last_access_ms = now_ms;
            entry.access_count = entry.access_count.saturating_add(1);
            if dirty && !entry.dirty {
                entry.dirty = true;
                entry.dirty_since_ms = now_ms;
            } else if dirty {
                entry.dirty_since_ms = now_ms;
            }
            return;
        }

        if self.cache.is_full() {
            let victim = self
                .cache
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_access_ms)
                .map(|(i, _)| i);
            if let Some(index) = victim {
                // Dirty data survives eviction or the entry stays.
                if !self.flush_entry(index) {
                    debug!(key_hash = self.cache[index].key_hash, "eviction flush failed");
                    return;
                }
                self.cache.remove(index);
            }
        }

        let _ = self.cache.push(CacheEntry {
            key_hash,
            value,
            last_access_ms: now_ms,
            dirty,
            dirty_since_ms: if dirty { now_ms } else { 0 },
            access_count: 1,
        });
    }

    fn get(&mut self, key_hash: u16, now_ms: u32) -> Option<f32> {
        let index = self.cache.iter().position(|e| e.key_hash == key_hash)?;
        let entry = &mut self.cache[index];
        entry.last_access_ms = now_ms;
        entry.access_count = entry.access_count.saturating_add(1);
        Some(entry.value)
    }
}

// ─── Manager ────────────────────────────────────────────────────────

/// Storage manager handle; clones share the cache and backend.
#[derive(Clone)]
pub struct StorageManager {
    inner: Rc<RefCell<StorageInner>>,
    bus: Rc<MessageBus>,
}

impl StorageManager {
    pub fn new(backend: Box<dyn StorageBackend>, bus: Rc<MessageBus>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StorageInner {
                backend,
                cache: heapless::Vec::new(),
                stats: StorageStats::default(),
            })),
            bus,
        }
    }

    /// Bring up the backend and subscribe the message handlers.
    pub fn init(&self) -> bool {
        if !self.inner.borrow_mut().backend.begin() {
            return false;
        }

        let inner = self.inner.clone();
        let bus = self.bus.clone();
        self.bus.subscribe(
            MSG_STORAGE_SAVE_FLOAT,
            handler(move |msg| {
                let Some(save) = SaveFloatMsg::from_msg(msg) else {
                    return;
                };
                let now_ms = (msg.timestamp_us / 1000) as u32;
                let mut inner = inner.borrow_mut();
                inner.put(save.key_hash, save.value, true, now_ms);
                let mut success = true;
                if save.priority != 0 {
                    if let Some(index) = inner
                        .cache
                        .iter()
                        .position(|e| e.key_hash == save.key_hash)
                    {
                        success = inner.flush_entry(index);
                    }
                }
                let mut out = [0u8; 8];
                out[0..2].copy_from_slice(&save.key_hash.to_le_bytes());
                out[2] = success as u8;
                out[3] = save.sender_id;
                bus.publish(MSG_STORAGE_SAVE_RESPONSE, &out);
            }),
        );

        let inner = self.inner.clone();
        let bus = self.bus.clone();
        self.bus.subscribe(
            MSG_STORAGE_LOAD_FLOAT,
            handler(move |msg| {
                let Some(load) = LoadFloatMsg::from_msg(msg) else {
                    return;
                };
                let now_ms = (msg.timestamp_us / 1000) as u32;
                let mut inner = inner.borrow_mut();

                let (value, success) = match inner.get(load.key_hash, now_ms) {
                    Some(value) => {
                        inner.stats.cache_hits += 1;
                        (value, true)
                    }
                    None => {
                        inner.stats.cache_misses += 1;
                        let mut buf = [0u8; 4];
                        match inner
                            .backend
                            .read_data(storage_key(load.key_hash), &mut buf)
                        {
                            Some(n) if n >= 4 => {
                                inner.stats.disk_reads += 1;
                                let value = f32::from_le_bytes(buf);
                                inner.put(load.key_hash, value, false, now_ms);
                                (value, true)
                            }
                            _ => (load.default_value, false),
                        }
                    }
                };

                let response = LoadResponseMsg {
                    key_hash: load.key_hash,
                    value,
                    success,
                    request_id: load.request_id,
                };
                bus.publish(MSG_STORAGE_LOAD_RESPONSE, &response.to_bytes());
            }),
        );

        let inner = self.inner.clone();
        self.bus.subscribe(
            MSG_STORAGE_COMMIT_CACHE,
            handler(move |_| {
                let mut inner = inner.borrow_mut();
                for i in 0..inner.cache.len() {
                    inner.flush_entry(i);
                }
            }),
        );

        let inner = self.inner.clone();
        let bus = self.bus.clone();
        self.bus.subscribe(
            MSG_STORAGE_STATS_REQUEST,
            handler(move |_| {
                let stats = inner.borrow().stats;
                let mut out = [0u8; 8];
                out[0..2].copy_from_slice(&(stats.cache_hits.min(65535) as u16).to_le_bytes());
                out[2..4].copy_from_slice(&(stats.cache_misses.min(65535) as u16).to_le_bytes());
                out[4..6].copy_from_slice(&(stats.disk_writes.min(65535) as u16).to_le_bytes());
                out[6..8].copy_from_slice(&(stats.disk_reads.min(65535) as u16).to_le_bytes());
                bus.publish(MSG_STORAGE_STATS_RESPONSE, &out);
            }),
        );

        true
    }

    /// Opportunistic write-behind: flush at most one long-dirty entry
    /// per loop pass.
    pub fn update(&self, now_ms: u32) {
        let mut inner = self.inner.borrow_mut();
        let candidate = inner.cache.iter().position(|e| {
            e.dirty && now_ms.saturating_sub(e.dirty_since_ms) >= DIRTY_FLUSH_MS
        });
        if let Some(index) = candidate {
            inner.flush_entry(index);
        }
    }

    // ─── Direct access (config manager, tests) ──────────────────────

    /// Write-through save of a named float.
    pub fn save_float(&self, key: &str, value: f32) -> bool {
        let hash = key_hash(key);
        let mut inner = self.inner.borrow_mut();
        let ok = inner
            .backend
            .write_data(storage_key(hash), &value.to_le_bytes());
        if ok {
            inner.stats.disk_writes += 1;
            let now = 0;
            inner.put(hash, value, false, now);
        }
        ok
    }

    /// Load a named float; returns `(value, found)`.
    pub fn load_float(&self, key: &str, default_value: f32) -> (f32, bool) {
        let hash = key_hash(key);
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.get(hash, 0) {
            inner.stats.cache_hits += 1;
            return (value, true);
        }
        inner.stats.cache_misses += 1;
        let mut buf = [0u8; 4];
        match inner.backend.read_data(storage_key(hash), &mut buf) {
            Some(n) if n >= 4 => {
                inner.stats.disk_reads += 1;
                let value = f32::from_le_bytes(buf);
                inner.put(hash, value, false, 0);
                (value, true)
            }
            _ => (default_value, false),
        }
    }

    /// Raw record write (identity strings, map cells) — bypasses the
    /// float cache.
    pub fn save_bytes(&self, key: u32, data: &[u8]) -> bool {
        let mut inner = self.inner.borrow_mut();
        let ok = inner.backend.write_data(key, data);
        if ok {
            inner.stats.disk_writes += 1;
        }
        ok
    }

    /// Raw record read; returns the stored size on success.
    pub fn load_bytes(&self, key: u32, buf: &mut [u8]) -> Option<usize> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.backend.read_data(key, buf);
        if n.is_some() {
            inner.stats.disk_reads += 1;
        }
        n
    }

    /// Remove a record (and any cached copy of it).
    pub fn delete_key(&self, key: u32) -> bool {
        let mut inner = self.inner.borrow_mut();
        if let Some(index) = inner
            .cache
            .iter()
            .position(|e| storage_key(e.key_hash) == key)
        {
            inner.cache.remove(index);
        }
        inner.backend.delete_key(key)
    }

    /// True when a record exists.
    pub fn key_exists(&self, key: u32) -> bool {
        self.inner.borrow_mut().backend.key_exists(key)
    }

    /// Flush every dirty cache entry.
    pub fn commit_cache(&self) {
        let mut inner = self.inner.borrow_mut();
        for i in 0..inner.cache.len() {
            inner.flush_entry(i);
        }
    }

    pub fn stats(&self) -> StorageStats {
        self.inner.borrow().stats
    }

    pub fn cache_len(&self) -> usize {
        self.inner.borrow().cache.len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
