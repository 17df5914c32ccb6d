//! Binary image of a cascade.
//!
//! Fixed little-endian layout, position-dependent, no tag/length framing:
//! a header (`num_keys` u64, `gamma` f64, `num_levels` u64,
//! `last_level_seed` u64, `fallback_present` u8), one metadata record per
//! level, each level's payload words plus rank directory, and finally the
//! fallback pairs in build order. Callers wanting magic bytes or version
//! tags wrap the image in their own envelope.

use crate::bitarray::BitArray;
use crate::builder::MphError;
use crate::cascade::{Level, Mphf};
use std::io::{Read, Write};

/// Upper bound on the level count accepted from an image; real cascades
/// stay far below it, so anything larger is a corrupt header.
const MAX_IMAGE_LEVELS: u64 = 1 << 16;

impl Mphf {
    /// Write the cascade to `w` in the fixed little-endian layout.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<(), MphError> {
        write_u64(w, self.num_keys)?;
        w.write_all(&self.gamma.to_le_bytes())?;
        write_u64(w, self.levels.len() as u64)?;
        write_u64(w, self.last_level_seed)?;
        w.write_all(&[u8::from(!self.fallback.is_empty())])?;

        for level in &self.levels {
            write_u64(w, level.size_in_bits)?;
            write_u64(w, level.bits.num_words() as u64)?;
            write_u64(w, level.seed)?;
            write_u64(w, level.rank_offset)?;
        }
        for level in &self.levels {
            for cell in 0..level.bits.num_words() {
                write_u64(w, level.bits.get64(cell))?;
            }
            let dir = level.bits.rank_dir();
            write_u64(w, dir.len() as u64)?;
            for &sample in dir {
                write_u64(w, sample)?;
            }
        }
        if !self.fallback.is_empty() {
            write_u64(w, self.fallback.len() as u64)?;
            for &(hash, idx) in &self.fallback {
                write_u64(w, hash)?;
                write_u64(w, idx)?;
            }
        }
        Ok(())
    }

    /// Read a cascade previously written by [`save`](Self::save).
    pub fn load<R: Read>(r: &mut R) -> Result<Self, MphError> {
        let num_keys = read_u64(r)?;
        let gamma = f64::from_le_bytes(read_array(r)?);
        let num_levels = read_u64(r)?;
        let last_level_seed = read_u64(r)?;
        let fallback_present = read_u8(r)?;
        if fallback_present > 1 {
            return Err(MphError::FormatMismatch("fallback flag must be 0 or 1"));
        }
        if num_levels > MAX_IMAGE_LEVELS {
            return Err(MphError::FormatMismatch("implausible level count"));
        }

        struct Meta {
            size_in_bits: u64,
            num_words: u64,
            seed: u64,
            rank_offset: u64,
        }

        let mut metas = Vec::with_capacity(num_levels as usize);
        for _ in 0..num_levels {
            let meta = Meta {
                size_in_bits: read_u64(r)?,
                num_words: read_u64(r)?,
                seed: read_u64(r)?,
                rank_offset: read_u64(r)?,
            };
            if meta.num_words != meta.size_in_bits.div_ceil(64) + 1 {
                return Err(MphError::FormatMismatch(
                    "word count does not match bit size",
                ));
            }
            metas.push(meta);
        }

        let mut levels = Vec::with_capacity(metas.len());
        for (index, meta) in metas.into_iter().enumerate() {
            // grow with the stream rather than trusting the claimed
            // length for the allocation
            let mut words = Vec::new();
            for _ in 0..meta.num_words {
                words.push(read_u64(r)?);
            }
            let dir_len = read_u64(r)?;
            if dir_len != meta.num_words.div_ceil(8) {
                return Err(MphError::FormatMismatch("rank directory length"));
            }
            let mut ranks = Vec::new();
            for _ in 0..dir_len {
                ranks.push(read_u64(r)?);
            }
            if ranks.first().copied().unwrap_or(meta.rank_offset) != meta.rank_offset {
                return Err(MphError::FormatMismatch(
                    "rank directory disagrees with rank offset",
                ));
            }
            levels.push(Level {
                index: index as u32,
                size_in_bits: meta.size_in_bits,
                seed: meta.seed,
                rank_offset: meta.rank_offset,
                bits: BitArray::from_parts(meta.size_in_bits, words, ranks),
            });
        }

        let mut fallback = Vec::new();
        if fallback_present == 1 {
            let len = read_u64(r)?;
            for _ in 0..len {
                let hash = read_u64(r)?;
                let idx = read_u64(r)?;
                fallback.push((hash, idx));
            }
        }

        Ok(Mphf::from_parts(
            num_keys,
            gamma,
            last_level_seed,
            levels,
            fallback,
        ))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MphError> {
        let mut out = Vec::new();
        self.save(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, MphError> {
        Self::load(&mut bytes)
    }
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<(), MphError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, MphError> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, MphError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_array<R: Read>(r: &mut R) -> Result<[u8; 8], MphError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildConfig, Builder};

    const HEADER_BYTES: usize = 8 + 8 + 8 + 8 + 1;

    fn sample_mphf(seed: u64) -> (Vec<u64>, Mphf) {
        let keys: Vec<u64> = (0..5_000).map(|i| i * 3 + 17).collect();
        let cfg = BuildConfig {
            seed,
            ..BuildConfig::default()
        };
        let mph = Builder::new().with_config(cfg).build(keys.clone()).unwrap();
        (keys, mph)
    }

    #[test]
    fn round_trip_preserves_lookups() {
        let (keys, mph) = sample_mphf(0x1234);
        let bytes = mph.to_bytes().unwrap();
        let loaded = Mphf::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.num_keys(), mph.num_keys());
        assert_eq!(loaded.num_levels(), mph.num_levels());
        assert_eq!(loaded.gamma(), mph.gamma());
        for &k in &keys {
            assert_eq!(loaded.index(&k), mph.index(&k));
        }
        // loading then saving reproduces the image byte for byte
        assert_eq!(loaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn equal_builds_serialize_identically() {
        let (_, a) = sample_mphf(0xABCD);
        let (_, b) = sample_mphf(0xABCD);
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn header_layout_is_fixed() {
        let (keys, mph) = sample_mphf(0x77);
        let bytes = mph.to_bytes().unwrap();
        assert_eq!(
            u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            keys.len() as u64
        );
        assert_eq!(bytes[8..16], 2.0f64.to_le_bytes());
        assert_eq!(
            u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            mph.num_levels() as u64
        );
        assert!(bytes[32] <= 1);
        // first level record follows the header directly
        let h = HEADER_BYTES;
        let size0 = u64::from_le_bytes(bytes[h..h + 8].try_into().unwrap());
        assert_eq!(size0, mph.levels()[0].size_in_bits());
        let words0 = u64::from_le_bytes(bytes[h + 8..h + 16].try_into().unwrap());
        assert_eq!(words0, size0 / 64 + 1);
    }

    #[test]
    fn truncated_image_is_an_io_error() {
        let (_, mph) = sample_mphf(0x99);
        let bytes = mph.to_bytes().unwrap();
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(Mphf::from_bytes(cut), Err(MphError::Io(_))));
    }

    #[test]
    fn inconsistent_word_count_is_rejected() {
        let (_, mph) = sample_mphf(0x42);
        let mut bytes = mph.to_bytes().unwrap();
        // corrupt the first level's num_words field
        bytes[HEADER_BYTES + 8] ^= 0xFF;
        assert!(matches!(
            Mphf::from_bytes(&bytes),
            Err(MphError::FormatMismatch(_))
        ));
    }

    #[test]
    fn fallback_pairs_survive_the_image() {
        let keys: Vec<u64> = (0..200).collect();
        let cfg = BuildConfig {
            max_levels: 0,
            ..BuildConfig::default()
        };
        let mph = Builder::new().with_config(cfg).build(keys.clone()).unwrap();
        let bytes = mph.to_bytes().unwrap();
        assert_eq!(bytes[32], 1, "fallback_present flag");
        let loaded = Mphf::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.fallback_len(), 200);
        for &k in &keys {
            assert_eq!(loaded.index(&k), mph.index(&k));
        }
    }

    #[test]
    fn empty_cascade_image() {
        let mph = Builder::new().build(Vec::<u64>::new()).unwrap();
        let bytes = mph.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_BYTES);
        let loaded = Mphf::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.num_keys(), 0);
        assert_eq!(loaded.num_levels(), 0);
    }
}
