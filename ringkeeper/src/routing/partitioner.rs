//! Partitioners compute the token of a partition key, which decides
//! which replicas own the data.
//!
//! Only `Murmur3Partitioner` is implemented, modified for compatibility
//! with Cassandra's implementation which treats bytes as signed.

use std::num::Wrapping;

use tracing::warn;

use crate::routing::Token;

/// Partitioner used by the cluster, as reported in `system.local`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[non_exhaustive]
pub enum PartitionerName {
    #[default]
    Murmur3,
}

impl PartitionerName {
    /// Recognizes a partitioner by its (possibly fully qualified) class name.
    pub fn from_str(name: &str) -> Option<Self> {
        if name.ends_with("Murmur3Partitioner") {
            Some(PartitionerName::Murmur3)
        } else {
            None
        }
    }

    /// Same as [`PartitionerName::from_str`], falling back to Murmur3 for unknown names.
    pub(crate) fn from_str_or_default(name: &str) -> Self {
        Self::from_str(name).unwrap_or_else(|| {
            warn!(
                partitioner = name,
                "Unsupported partitioner, token-aware replica lookups assume Murmur3"
            );
            PartitionerName::Murmur3
        })
    }

    /// Computes the token of an already serialized partition key.
    pub fn hash(&self, partition_key: &[u8]) -> Token {
        match self {
            PartitionerName::Murmur3 => murmur3_token(partition_key),
        }
    }
}

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);

    k
}

#[inline]
fn mix_k1(mut k1: Wrapping<i64>) -> Wrapping<i64> {
    k1 *= C1;
    k1 = rotl64(k1, 31);
    k1 * C2
}

#[inline]
fn mix_k2(mut k2: Wrapping<i64>) -> Wrapping<i64> {
    k2 *= C2;
    k2 = rotl64(k2, 33);
    k2 * C1
}

fn read_i64_le(block: &[u8]) -> Wrapping<i64> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&block[..8]);
    Wrapping(i64::from_le_bytes(bytes))
}

// x64 128-bit variant of Murmur3 with seed 0, keeping only the lower half as the token.
// The tail bytes are sign extended, which is where Cassandra differs from the reference.
fn murmur3_token(data: &[u8]) -> Token {
    let mut h1 = Wrapping(0_i64);
    let mut h2 = Wrapping(0_i64);

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let k1 = read_i64_le(&block[..8]);
        let k2 = read_i64_le(&block[8..]);

        h1 ^= mix_k1(k1);
        h1 = rotl64(h1, 27);
        h1 += h2;
        h1 = h1 * Wrapping(5) + Wrapping(0x52dce729);

        h2 ^= mix_k2(k2);
        h2 = rotl64(h2, 31);
        h2 += h1;
        h2 = h2 * Wrapping(5) + Wrapping(0x38495ab5);
    }

    let tail = blocks.remainder();
    let mut k1 = Wrapping(0_i64);
    let mut k2 = Wrapping(0_i64);
    for (i, byte) in tail.iter().enumerate().rev() {
        let signed = Wrapping(*byte as i8 as i64);
        if i >= 8 {
            k2 ^= signed << ((i - 8) * 8);
        } else {
            k1 ^= signed << (i * 8);
        }
    }
    if tail.len() > 8 {
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    h1 ^= Wrapping(data.len() as i64);
    h2 ^= Wrapping(data.len() as i64);

    h1 += h2;
    h2 += h1;

    h1 = fmix(h1);
    h2 = fmix(h2);

    h1 += h2;

    Token::new(h1.0)
}

#[cfg(test)]
mod tests {
    use super::PartitionerName;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn test_murmur3_partitioner() {
        setup_tracing();
        for (pk, expected) in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_eq!(PartitionerName::Murmur3.hash(pk.as_bytes()).value(), expected);
        }
    }

    #[test]
    fn partitioner_names() {
        setup_tracing();
        assert_eq!(
            PartitionerName::from_str("org.apache.cassandra.dht.Murmur3Partitioner"),
            Some(PartitionerName::Murmur3)
        );
        assert_eq!(
            PartitionerName::from_str("org.apache.cassandra.dht.RandomPartitioner"),
            None
        );
        assert_eq!(
            PartitionerName::from_str_or_default("ByteOrderedPartitioner"),
            PartitionerName::Murmur3
        );
    }
}
