//! Hash and position functions shared by the ring variants.

use md5::{Digest, Md5};

const FNV32_OFFSET: u32 = 2_166_136_261;
const FNV32_PRIME: u32 = 16_777_619;
const FNV64_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV64_PRIME: u64 = 1_099_511_628_211;

/// 32-bit FNV-1a.
pub fn fnv1a32(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(FNV32_PRIME)
    })
}

/// 64-bit FNV-1a.
pub fn fnv1a64(data: &[u8]) -> u64 {
    data.iter().fold(FNV64_OFFSET, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(FNV64_PRIME)
    })
}

/// Position on carbon's 16-bit ring: the first two bytes of the MD5 digest.
pub fn carbon_position(key: &str) -> u16 {
    let digest = Md5::digest(key.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// Position on carbon-c-relay's 16-bit ring: FNV1a folded onto itself.
pub fn fnv1a_position(key: &str) -> u16 {
    let h = fnv1a32(key.as_bytes());
    ((h >> 16) ^ (h & 0xFFFF)) as u16
}

/// Google's jump consistent hash: maps `key` to a bucket in `0..buckets`.
///
/// Returns `-1` when `buckets` is zero.
pub fn jump(mut key: u64, buckets: usize) -> i64 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b
}

/// Marsaglia xorshift* step used to derive successive replica keys.
pub fn xorshift64(mut i: u64) -> u64 {
    i ^= i >> 12;
    i ^= i << 25;
    i ^= i >> 27;
    i.wrapping_mul(2_685_821_657_736_338_717)
}
