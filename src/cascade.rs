//! The finalized cascade: per-level metadata, the fallback table, and the
//! read-only lookup walk.

use crate::bitarray::BitArray;
use crate::hash::{fast_reduce64, MphKey};
use hashbrown::HashMap;

/// One bit-array of the cascade together with what lookup needs to
/// address it.
#[derive(Debug, Clone)]
pub struct Level {
    pub(crate) index: u32,
    pub(crate) size_in_bits: u64,
    pub(crate) seed: u64,
    /// Cumulative set-bit count of all prior levels; folded into this
    /// level's rank directory so `rank` answers globally.
    pub(crate) rank_offset: u64,
    pub(crate) bits: BitArray,
}

impl Level {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn size_in_bits(&self) -> u64 {
        self.size_in_bits
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn rank_offset(&self) -> u64 {
        self.rank_offset
    }

    #[inline]
    pub(crate) fn bits(&self) -> &BitArray {
        &self.bits
    }

    /// Position of `key` within this level.
    #[inline]
    pub(crate) fn position<K: MphKey + ?Sized>(&self, key: &K) -> u64 {
        fast_reduce64(key.hash64(self.seed), self.size_in_bits as usize) as u64
    }
}

/// Minimal perfect hash over the build key set: maps each build key to a
/// distinct index in `[0, num_keys)`. Read-only and lock-free after
/// construction; queries for keys outside the build set return an
/// arbitrary in-range value.
#[derive(Debug, Clone)]
pub struct Mphf {
    pub(crate) num_keys: u64,
    pub(crate) gamma: f64,
    pub(crate) last_level_seed: u64,
    pub(crate) levels: Vec<Level>,
    /// `(hash under last_level_seed, assigned index)` in build order; the
    /// order is part of the serialized image.
    pub(crate) fallback: Vec<(u64, u64)>,
    pub(crate) fallback_map: HashMap<u64, u64>,
}

impl Mphf {
    pub(crate) fn from_parts(
        num_keys: u64,
        gamma: f64,
        last_level_seed: u64,
        levels: Vec<Level>,
        fallback: Vec<(u64, u64)>,
    ) -> Self {
        let fallback_map = fallback.iter().copied().collect();
        Self {
            num_keys,
            gamma,
            last_level_seed,
            levels,
            fallback,
            fallback_map,
        }
    }

    /// O(1) expected lookup: walk the levels and answer with the rank of
    /// the first set position; keys the cascade never placed resolve
    /// through the fallback table.
    #[inline]
    pub fn index<K: MphKey + ?Sized>(&self, key: &K) -> u64 {
        for level in &self.levels {
            let p = level.position(key);
            if level.bits.get(p) == 1 {
                return level.bits.rank(p);
            }
        }
        let h = key.hash64(self.last_level_seed);
        self.fallback_map.get(&h).copied().unwrap_or(0)
    }

    #[inline]
    pub fn index_u64(&self, key: u64) -> u64 {
        self.index(&key)
    }

    #[inline]
    pub fn index_str(&self, key: &str) -> u64 {
        self.index(key)
    }

    #[inline]
    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    #[inline]
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Keys that ended up in the explicit fallback table.
    #[inline]
    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    /// Approximate in-memory footprint of the cascade.
    pub fn memory_usage_bytes(&self) -> usize {
        let bits: u64 = self.levels.iter().map(|l| l.bits.bit_size()).sum();
        std::mem::size_of::<Self>()
            + (bits / 8) as usize
            + self.fallback.len() * std::mem::size_of::<(u64, u64)>() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;

    #[test]
    fn lookup_walks_to_later_levels() {
        let keys: Vec<u64> = (0..5_000).map(|i| i * 2 + 1).collect();
        let mph = Builder::new().build(keys.clone()).unwrap();
        assert!(mph.num_levels() > 1, "5000 keys should spill past level 0");
        let mut hit_later = false;
        for &k in &keys {
            let first = &mph.levels()[0];
            if first.bits().get(first.position(&k)) == 0 {
                hit_later = true;
                break;
            }
        }
        assert!(hit_later, "some key must resolve past level 0");
    }

    #[test]
    fn non_member_lookup_is_bounded() {
        let keys: Vec<u64> = (0..1_000).collect();
        let mph = Builder::new().build(keys).unwrap();
        // Unspecified value, but total and in no case a panic.
        for probe in [1_000u64, u64::MAX, 0xDEAD_BEEF] {
            let _ = mph.index(&probe);
        }
    }

    #[test]
    fn string_and_bytes_keys_share_results() {
        let keys: Vec<String> = (0..500).map(|i| format!("key-{i:05}")).collect();
        let mph = Builder::new().build(keys.clone()).unwrap();
        for k in &keys {
            assert_eq!(mph.index(k.as_str()), mph.index(&k.as_bytes().to_vec()));
        }
    }
}
