use image::imageops::FilterType;
use image::GenericImageView;
use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::errors::{ConfigError, WorkerError};

/// Content fingerprint used as the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Perceptual average hash of an encoded image.
    ///
    /// Dimensions are part of the key because cached geometry is in pixel
    /// coordinates of the source image.
    pub fn of_image(image_bytes: &[u8]) -> Result<Self, WorkerError> {
        let image = image::load_from_memory(image_bytes)
            .map_err(|e| WorkerError::Decode(format!("image decode failed: {}", e)))?;
        let (width, height) = image.dimensions();

        // 8x8 grayscale thumbnail, one bit per pixel brighter than the mean
        let thumb = image.resize_exact(8, 8, FilterType::Triangle).to_luma8();
        let mean = thumb.pixels().map(|p| p[0] as u32).sum::<u32>() as f32 / 64.0;
        let bits = thumb
            .pixels()
            .enumerate()
            .fold(0u64, |acc, (i, p)| if p[0] as f32 > mean { acc | (1 << i) } else { acc });

        Ok(Self(format!("ahash:{}x{}:{:016x}", width, height, bits)))
    }

    /// xxHash3 over a length-prefixed text list
    pub fn of_texts(texts: &[String]) -> Self {
        let total: usize = texts.iter().map(|t| t.len() + 8).sum();
        let mut hash_input = Vec::with_capacity(total + 8);
        hash_input.extend_from_slice(&(texts.len() as u64).to_le_bytes());
        for text in texts {
            hash_input.extend_from_slice(&(text.len() as u64).to_le_bytes());
            hash_input.extend_from_slice(text.as_bytes());
        }
        Self(format!("xxh3:{:016x}", xxh3_64(&hash_input)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which entry leaves the cache when it is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Oldest insertion goes first; lookups do not refresh an entry
    #[default]
    InsertionOrder,
    /// Least recently read or written entry goes first
    LeastRecentlyUsed,
}

enum Store<V> {
    InsertionOrder {
        order: VecDeque<Fingerprint>,
        entries: HashMap<Fingerprint, V>,
    },
    LeastRecentlyUsed(LruCache<Fingerprint, V>),
}

/// Bounded result cache owned by a single worker.
///
/// Not synchronized: each worker shell holds its cache by value and is the
/// only code that touches it.
pub struct ResultCache<V> {
    capacity: NonZeroUsize,
    policy: EvictionPolicy,
    store: Store<V>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::InvalidCacheCapacity)?;
        let store = match policy {
            EvictionPolicy::InsertionOrder => Store::InsertionOrder {
                order: VecDeque::with_capacity(capacity.get()),
                entries: HashMap::with_capacity(capacity.get()),
            },
            EvictionPolicy::LeastRecentlyUsed => Store::LeastRecentlyUsed(LruCache::new(capacity)),
        };
        Ok(Self {
            capacity,
            policy,
            store,
        })
    }

    /// Look up a cached value
    pub fn lookup(&mut self, fingerprint: &Fingerprint) -> Option<V> {
        match &mut self.store {
            Store::InsertionOrder { entries, .. } => entries.get(fingerprint).cloned(),
            Store::LeastRecentlyUsed(lru) => lru.get(fingerprint).cloned(),
        }
    }

    /// Insert a value, returning the evicted fingerprint if one was dropped.
    ///
    /// Re-inserting an existing fingerprint replaces its value in place.
    pub fn insert(&mut self, fingerprint: Fingerprint, value: V) -> Option<Fingerprint> {
        let capacity = self.capacity.get();
        match &mut self.store {
            Store::InsertionOrder { order, entries } => {
                if let Some(existing) = entries.get_mut(&fingerprint) {
                    *existing = value;
                    return None;
                }

                let evicted = if entries.len() >= capacity {
                    let oldest = order.pop_front();
                    if let Some(ref key) = oldest {
                        entries.remove(key);
                    }
                    oldest
                } else {
                    None
                };

                order.push_back(fingerprint.clone());
                entries.insert(fingerprint, value);
                evicted
            }
            Store::LeastRecentlyUsed(lru) => match lru.push(fingerprint.clone(), value) {
                Some((key, _)) if key != fingerprint => Some(key),
                _ => None,
            },
        }
    }

    /// Presence check that never touches recency
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        match &self.store {
            Store::InsertionOrder { entries, .. } => entries.contains_key(fingerprint),
            Store::LeastRecentlyUsed(lru) => lru.contains(fingerprint),
        }
    }

    pub fn len(&self) -> usize {
        match &self.store {
            Store::InsertionOrder { entries, .. } => entries.len(),
            Store::LeastRecentlyUsed(lru) => lru.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}
