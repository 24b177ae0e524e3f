/// Key hash functions used to place keys on a pool's continuum
///
/// Every function maps a key to 32 bits. Outputs match the classic
/// memcached-proxy family bit for bit, including its quirks (`crc32` keeps
/// only 15 bits, `fnv1a_64` works on a truncated 32-bit state), so that a
/// ring built here agrees with rings built by existing deployments.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::crc16;

/// Anything that can turn key bytes into a ring position
pub trait KeyHasher {
    fn hash(&self, key: &[u8]) -> u32;
}

impl<F> KeyHasher for F
where
    F: Fn(&[u8]) -> u32,
{
    fn hash(&self, key: &[u8]) -> u32 {
        self(key)
    }
}

/// Built-in key hash functions, named as they appear in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashKind {
    #[serde(rename = "one_at_a_time")]
    OneAtATime,
    #[serde(rename = "md5")]
    Md5,
    #[serde(rename = "crc16")]
    Crc16,
    #[serde(rename = "crc32")]
    Crc32,
    #[serde(rename = "crc32a")]
    Crc32a,
    #[serde(rename = "fnv1_64")]
    Fnv1_64,
    #[default]
    #[serde(rename = "fnv1a_64")]
    Fnv1a64,
    #[serde(rename = "fnv1_32")]
    Fnv1_32,
    #[serde(rename = "fnv1a_32")]
    Fnv1a32,
    #[serde(rename = "hsieh")]
    Hsieh,
    #[serde(rename = "murmur")]
    Murmur,
}

impl HashKind {
    pub const ALL: [HashKind; 11] = [
        HashKind::OneAtATime,
        HashKind::Md5,
        HashKind::Crc16,
        HashKind::Crc32,
        HashKind::Crc32a,
        HashKind::Fnv1_64,
        HashKind::Fnv1a64,
        HashKind::Fnv1_32,
        HashKind::Fnv1a32,
        HashKind::Hsieh,
        HashKind::Murmur,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HashKind::OneAtATime => "one_at_a_time",
            HashKind::Md5 => "md5",
            HashKind::Crc16 => "crc16",
            HashKind::Crc32 => "crc32",
            HashKind::Crc32a => "crc32a",
            HashKind::Fnv1_64 => "fnv1_64",
            HashKind::Fnv1a64 => "fnv1a_64",
            HashKind::Fnv1_32 => "fnv1_32",
            HashKind::Fnv1a32 => "fnv1a_32",
            HashKind::Hsieh => "hsieh",
            HashKind::Murmur => "murmur",
        }
    }
}

impl KeyHasher for HashKind {
    fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashKind::OneAtATime => one_at_a_time(key),
            HashKind::Md5 => md5(key),
            HashKind::Crc16 => crc16(key) as u32,
            HashKind::Crc32 => crc32(key),
            HashKind::Crc32a => crc32a(key),
            HashKind::Fnv1_64 => fnv1_64(key),
            HashKind::Fnv1a64 => fnv1a_64(key),
            HashKind::Fnv1_32 => fnv1_32(key),
            HashKind::Fnv1a32 => fnv1a_32(key),
            HashKind::Hsieh => hsieh(key),
            HashKind::Murmur => murmur(key),
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown hash function: {}", s))
    }
}

const FNV_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_32_INIT: u32 = 2_166_136_261;
const FNV_32_PRIME: u32 = 16_777_619;

// Bytes are widened as signed chars.
#[inline]
fn signed(byte: u8) -> u32 {
    byte as i8 as i32 as u32
}

pub fn one_at_a_time(key: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &byte in key {
        value = value.wrapping_add(signed(byte));
        value = value.wrapping_add(value << 10);
        value ^= value >> 6;
    }
    value = value.wrapping_add(value << 3);
    value ^= value >> 11;
    value.wrapping_add(value << 15)
}

/// First four digest bytes, little endian
pub fn md5(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xedb8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc32_raw(key: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in key {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize];
    }
    !crc
}

pub fn crc32(key: &[u8]) -> u32 {
    (crc32_raw(key) >> 16) & 0x7fff
}

pub fn crc32a(key: &[u8]) -> u32 {
    crc32_raw(key)
}

pub fn fnv1_64(key: &[u8]) -> u32 {
    let mut hash = FNV_64_INIT;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_64_PRIME);
        hash ^= byte as u64;
    }
    hash as u32
}

pub fn fnv1a_64(key: &[u8]) -> u32 {
    let mut hash = FNV_64_INIT as u32;
    for &byte in key {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_64_PRIME as u32);
    }
    hash
}

pub fn fnv1_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_INIT;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= byte as u32;
    }
    hash
}

pub fn fnv1a_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_INIT;
    for &byte in key {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}

#[inline]
fn get16(key: &[u8], at: usize) -> u32 {
    u16::from_le_bytes([key[at], key[at + 1]]) as u32
}

/// Paul Hsieh's SuperFastHash, zero-seeded
pub fn hsieh(key: &[u8]) -> u32 {
    if key.is_empty() {
        return 0;
    }

    let mut hash: u32 = 0;
    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        hash = hash.wrapping_add(get16(chunk, 0));
        let tmp = (get16(chunk, 2) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }

    let rem = chunks.remainder();
    match rem.len() {
        3 => {
            hash = hash.wrapping_add(get16(rem, 0));
            hash ^= hash << 16;
            hash ^= signed(rem[2]) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(get16(rem, 0));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(signed(rem[0]));
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash.wrapping_add(hash >> 6)
}

/// MurmurHash2 seeded with `0xdeadbeef * len`
pub fn murmur(key: &[u8]) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = key.len() as u32;
    let seed = 0xdead_beef_u32.wrapping_mul(len);
    let mut h = seed ^ len;

    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let rem = chunks.remainder();
    if rem.len() >= 3 {
        h ^= (rem[2] as u32) << 16;
    }
    if rem.len() >= 2 {
        h ^= (rem[1] as u32) << 8;
    }
    if !rem.is_empty() {
        h ^= rem[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^ (h >> 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&[u8]; 5] = [b"", b"a", b"foo", b"hello world", b"123456789"];

    fn check(kind: HashKind, expected: [u32; 5]) {
        for (key, want) in KEYS.iter().zip(expected) {
            assert_eq!(
                kind.hash(key),
                want,
                "{} of {:?}",
                kind,
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn test_one_at_a_time() {
        check(
            HashKind::OneAtATime,
            [0, 3392050242, 596015325, 1045060183, 3328923845],
        );
    }

    #[test]
    fn test_md5() {
        check(
            HashKind::Md5,
            [3649838548, 3111502092, 3675831724, 3141252702, 2498230565],
        );
    }

    #[test]
    fn test_crc_family() {
        check(HashKind::Crc16, [0, 31879, 44950, 15332, 12739]);
        check(HashKind::Crc32, [0, 26807, 3187, 3402, 19444]);
        check(
            HashKind::Crc32a,
            [0, 3904355907, 2356372769, 222957957, 0xcbf4_3926],
        );
    }

    #[test]
    fn test_fnv_family() {
        check(
            HashKind::Fnv1_64,
            [2216829733, 2248259518, 1805727027, 2979073647, 737744598],
        );
        check(
            HashKind::Fnv1a64,
            [2216829733, 2248273036, 4275688823, 37540583, 600231420],
        );
        check(
            HashKind::Fnv1_32,
            [2166136261, 84696446, 1083137555, 1418570095, 605325334],
        );
        check(
            HashKind::Fnv1a32,
            [2166136261, 0xe40c_292c, 2851307223, 3582672807, 3146166556],
        );
    }

    #[test]
    fn test_hsieh_and_murmur() {
        check(
            HashKind::Hsieh,
            [0, 2472816263, 1993659431, 1333368947, 3841726064],
        );
        check(
            HashKind::Murmur,
            [0, 1262581116, 3303027599, 1578702139, 3077965456],
        );
    }

    #[test]
    fn test_hash_kind_names() {
        for kind in HashKind::ALL {
            assert_eq!(kind.name().parse::<HashKind>(), Ok(kind));
        }
        assert!("jenkins".parse::<HashKind>().is_err());
        assert_eq!(HashKind::default(), HashKind::Fnv1a64);
    }

    #[test]
    fn test_closure_hasher() {
        let constant = |_: &[u8]| 7u32;
        assert_eq!(constant.hash(b"anything"), 7);
    }
}
