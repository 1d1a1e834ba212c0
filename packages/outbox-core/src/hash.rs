//! MurmurHash3 (x86, 32-bit) utilities for partition routing.
//!
//! Partition assignment must be reproducible across processes and across
//! restarts without any coordination, so the hash is a pure function over
//! the key's UTF-8 bytes with a fixed seed -- no per-process salt.

/// Number of fixed partitions in the ring. Changing this after deployment
/// invalidates every existing record's `partition` column.
pub const PARTITION_COUNT: u32 = 256;

const SEED: u32 = 0;
const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// 32-bit MurmurHash3 (x86 variant) over `data`, seeded with `seed`.
#[must_use]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k1: u32 = 0;
        for (i, &byte) in tail.iter().enumerate() {
            k1 |= u32::from(byte) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k1;
    }

    hash ^= data.len() as u32;
    fmix32(hash)
}

/// MurmurHash3's finalization mixer: forces every bit of the hash to avalanche.
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Maps `key` to a partition number in `[0, PARTITION_COUNT)`.
///
/// Deterministic and stable: the same key always routes to the same
/// partition for the lifetime of the deployment's partition count.
#[must_use]
pub fn partition_of(key: &str) -> u32 {
    murmur3_32(key.as_bytes(), SEED) % PARTITION_COUNT
}
