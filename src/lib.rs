//! Cuckoo filter for arbitrary byte-string keys.
//!
//! A [`Filter`] answers "possibly present" or "definitely absent" using a table
//! of 16-bit fingerprints packed four to a bucket. Every key has exactly two
//! candidate buckets, linked by an XOR transform of the fingerprint, which lets
//! an insertion relocate existing fingerprints (a bounded random walk) when
//! both candidates are full. Unlike a Bloom filter, keys can be deleted.
//!
//! Build a filter with [`Filter::new`] (or [`Filter::with_config`] /
//! [`Filter::with_seed`]) sized for the largest number of keys you expect to
//! hold. When [`Filter::add`] returns [`Error::TooFull`] the filter has reached
//! its practical capacity and should be rebuilt larger.

use std::fmt;
use std::mem;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Number of fingerprint slots per bucket.
pub const ENTRIES_PER_BUCKET: usize = 4;
/// Average bucket load above which the sizing policy doubles the table.
pub const DEFAULT_LOAD_FACTOR: f64 = 0.95;
/// Displacement budget used by [`FilterConfig::default`].
pub const DEFAULT_MAX_DISPLACEMENTS: usize = 500;
const FINGERPRINT_BITS: u32 = 16;
const EMPTY: Fingerprint = 0;

/// A stored fingerprint. Zero is reserved for empty slots.
pub type Fingerprint = u16;

type Bucket = [Fingerprint; ENTRIES_PER_BUCKET];

/// Errors reported by the filter.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The displacement budget ran out before a free slot was found.
    ///
    /// The filter must be rebuilt with a larger `max_keys`. The attempt is not
    /// a no-op: fingerprints moved during the walk stay where they were moved,
    /// and one fingerprint is dropped.
    #[error("cuckoo filter too full")]
    TooFull,
    /// The provided configuration values are invalid.
    #[error("invalid filter configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type alias for filter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration options for building a [`Filter`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterConfig {
    /// Maximum number of evictions attempted by a single insertion.
    pub max_displacements: usize,
    /// Target average bucket load in `(0, 1]`; the table is doubled once when
    /// `max_keys` would exceed it.
    pub load_factor: f64,
    /// Seed for the eviction walk. `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_displacements: DEFAULT_MAX_DISPLACEMENTS,
            load_factor: DEFAULT_LOAD_FACTOR,
            seed: None,
        }
    }
}

impl FilterConfig {
    fn validate(&self) -> Result<()> {
        if self.max_displacements == 0 {
            return Err(Error::InvalidConfig(
                "max_displacements must be at least 1",
            ));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(Error::InvalidConfig("load_factor must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Summary statistics for a filter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterStats {
    pub bucket_count: usize,
    /// Total number of fingerprint slots.
    pub capacity: usize,
    /// Number of occupied slots.
    pub len: usize,
    /// Fraction of slots that are occupied.
    pub load_factor: f64,
    /// Size of the fingerprint table in bytes.
    pub fingerprint_bytes: usize,
    pub max_displacements: usize,
}

/// A cuckoo filter over byte-string keys.
///
/// The filter is single-owner: mutation takes `&mut self`, so sharing it
/// between writers requires an external lock. Lookups take `&self` and can
/// run from many threads at once (see [`Filter::contains_batch`]).
#[derive(Clone)]
pub struct Filter {
    table: Vec<Bucket>,
    bucket_count: usize,
    len: usize,
    max_displacements: usize,
    rng: StdRng,
}

/// The fingerprint and both candidate buckets derived from one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidates {
    fingerprint: Fingerprint,
    primary: usize,
    alternate: usize,
}

impl Filter {
    /// Creates a filter sized to hold up to `max_keys` keys.
    pub fn new(max_keys: usize) -> Self {
        Self::build(max_keys, &FilterConfig::default())
    }

    /// Creates a filter whose eviction walk is reproducible for a given seed.
    pub fn with_seed(max_keys: usize, seed: u64) -> Self {
        let config = FilterConfig {
            seed: Some(seed),
            ..FilterConfig::default()
        };
        Self::build(max_keys, &config)
    }

    /// Creates a filter using an explicit configuration.
    pub fn with_config(max_keys: usize, config: &FilterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(max_keys, config))
    }

    fn build(max_keys: usize, config: &FilterConfig) -> Self {
        let bucket_count = bucket_count_for(max_keys, config.load_factor);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        debug!(
            max_keys,
            bucket_count,
            capacity = bucket_count * ENTRIES_PER_BUCKET,
            max_displacements = config.max_displacements,
            "allocated cuckoo filter"
        );

        Self {
            table: vec![[EMPTY; ENTRIES_PER_BUCKET]; bucket_count],
            bucket_count,
            len: 0,
            max_displacements: config.max_displacements,
            rng,
        }
    }

    /// Adds a key to the filter.
    ///
    /// Returns [`Error::TooFull`] when both candidate buckets are full and the
    /// eviction walk exhausts its budget. The failed attempt is not undone:
    /// fingerprints stay where the walk moved them and the one carried at the
    /// end, which may belong to this key or to an earlier one, is dropped.
    /// Rebuild the filter with a larger `max_keys`.
    pub fn add(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        let Candidates {
            fingerprint,
            primary,
            alternate,
        } = self.candidates(key.as_ref());

        if self.place(primary, fingerprint) || self.place(alternate, fingerprint) {
            return Ok(());
        }

        let mut index = if self.rng.gen::<bool>() {
            primary
        } else {
            alternate
        };
        let mut carried = fingerprint;

        for _ in 0..self.max_displacements {
            let slot = self.rng.gen_range(0..ENTRIES_PER_BUCKET);
            carried = mem::replace(&mut self.table[index][slot], carried);
            index = self.alternate_index(index, carried);

            if self.place(index, carried) {
                return Ok(());
            }
        }

        warn!(
            bucket_count = self.bucket_count,
            len = self.len,
            max_displacements = self.max_displacements,
            "cuckoo filter too full, dropped a fingerprint"
        );
        Err(Error::TooFull)
    }

    /// Adds a key only if it is not already (possibly) present.
    ///
    /// Returns `Ok(false)` without modifying the filter when `contains` is
    /// already true for the key, which includes false positives.
    pub fn add_unique(&mut self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        if self.contains(key) {
            return Ok(false);
        }
        self.add(key).map(|()| true)
    }

    /// Adds every key in order and returns how many were inserted.
    ///
    /// Stops at the first [`Error::TooFull`]; keys added before the failure
    /// stay in the filter.
    pub fn add_all<I>(&mut self, keys: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut inserted = 0;
        for key in keys {
            self.add(key)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Returns whether the key may be in the set.
    ///
    /// False positives are possible; false negatives are not for keys that
    /// were added successfully and not deleted since.
    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        let c = self.candidates(key.as_ref());
        self.match_position(c.primary, c.fingerprint).is_some()
            || self.match_position(c.alternate, c.fingerprint).is_some()
    }

    /// Looks up many keys in parallel. The result is in input order.
    pub fn contains_batch<K>(&self, keys: &[K]) -> Vec<bool>
    where
        K: AsRef<[u8]> + Sync,
    {
        keys.par_iter().map(|key| self.contains(key)).collect()
    }

    /// Removes a key from the filter, returning whether a fingerprint was
    /// removed.
    ///
    /// Only delete keys that were previously added and not yet deleted.
    /// Deleting any other key can remove the fingerprint of a different key
    /// that shares it, which then becomes a false negative. This cannot be
    /// detected.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> bool {
        let Candidates {
            fingerprint,
            primary,
            alternate,
        } = self.candidates(key.as_ref());

        for index in [primary, alternate] {
            if let Some(slot) = self.match_position(index, fingerprint) {
                self.table[index][slot] = EMPTY;
                self.len -= 1;
                return true;
            }
        }

        false
    }

    /// Empties every slot. The geometry and the eviction RNG are kept.
    pub fn clear(&mut self) {
        trace!(len = self.len, "clearing cuckoo filter");
        self.table.fill([EMPTY; ENTRIES_PER_BUCKET]);
        self.len = 0;
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Total number of fingerprint slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bucket_count * ENTRIES_PER_BUCKET
    }

    /// Number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fraction of slots currently occupied.
    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.capacity() as f64
    }

    /// Size of the fingerprint table in bytes.
    pub fn fingerprint_bytes(&self) -> usize {
        self.table.len() * mem::size_of::<Bucket>()
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            bucket_count: self.bucket_count,
            capacity: self.capacity(),
            len: self.len,
            load_factor: self.load_factor(),
            fingerprint_bytes: self.fingerprint_bytes(),
            max_displacements: self.max_displacements,
        }
    }

    #[inline]
    fn candidates(&self, key: &[u8]) -> Candidates {
        let h = hash(key);
        let fingerprint = fingerprint(h as u32);
        let primary = self.bucket_index(h >> 32);
        let alternate = self.alternate_index(primary, fingerprint);
        Candidates {
            fingerprint,
            primary,
            alternate,
        }
    }

    #[inline]
    fn bucket_index(&self, hv: u64) -> usize {
        (hv % self.bucket_count as u64) as usize
    }

    /// Partner bucket of `index` for `fp`. Applying it twice returns `index`.
    #[inline]
    fn alternate_index(&self, index: usize, fp: Fingerprint) -> usize {
        let hv = hash(&fp.to_le_bytes()) as u32;
        self.bucket_index(index as u64 ^ u64::from(hv))
    }

    #[inline]
    fn match_position(&self, index: usize, fp: Fingerprint) -> Option<usize> {
        self.table[index].iter().position(|&slot| slot == fp)
    }

    #[inline]
    fn empty_position(&self, index: usize) -> Option<usize> {
        self.match_position(index, EMPTY)
    }

    fn place(&mut self, index: usize, fp: Fingerprint) -> bool {
        match self.empty_position(index) {
            Some(slot) => {
                self.table[index][slot] = fp;
                self.len += 1;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("bucket_count", &self.bucket_count)
            .field("len", &self.len)
            .field("max_displacements", &self.max_displacements)
            .finish_non_exhaustive()
    }
}

/// Smallest power of two holding `max_keys / 4` buckets, doubled once if the
/// average load would exceed `load_factor`. Never returns 0.
fn bucket_count_for(max_keys: usize, load_factor: f64) -> usize {
    let mut bucket_count = (max_keys / ENTRIES_PER_BUCKET).max(1).next_power_of_two();

    // Too close to full and insertions start running out of displacements.
    if max_keys as f64 / bucket_count as f64 / ENTRIES_PER_BUCKET as f64 > load_factor {
        bucket_count <<= 1;
    }

    bucket_count
}

#[inline]
fn hash(data: &[u8]) -> u64 {
    xxh3_64(data)
}

#[inline]
fn fingerprint(hv: u32) -> Fingerprint {
    let fp = (hv & ((1 << FINGERPRINT_BITS) - 1)) as Fingerprint;
    if fp == EMPTY {
        1
    } else {
        fp
    }
}
