//! Token computation for the three supported partitioners. The token
//! is the unit the topology/ring layer (`cql-driver`) reasons about; this
//! module only knows how to derive one from a partition key's serialized
//! bytes.

use num_bigint::BigInt;
use num_traits::Zero;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionerKind {
    Murmur3,
    Random,
    ByteOrdered,
}

/// A token in whichever domain its partitioner defines. Ordering is only
/// meaningful between tokens of the same variant; comparing across
/// partitioner kinds is a caller bug, not something this type prevents,
/// since a single cluster never mixes partitioners.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Token {
    /// Signed 64-bit hash, `Murmur3Partitioner`'s domain.
    Int64(i64),
    /// Arbitrary-precision non-negative integer, `RandomPartitioner`'s domain.
    BigUint(BigInt),
    /// Raw key bytes compared lexicographically, `ByteOrderedPartitioner`'s domain.
    Bytes(Vec<u8>),
}

impl PartitionerKind {
    pub fn token_for(self, partition_key: &[u8]) -> Token {
        match self {
            PartitionerKind::Murmur3 => Token::Int64(murmur3_token(partition_key)),
            PartitionerKind::Random => Token::BigUint(random_partitioner_token(partition_key)),
            PartitionerKind::ByteOrdered => Token::Bytes(partition_key.to_vec()),
        }
    }

    pub fn min_token(self) -> Token {
        match self {
            PartitionerKind::Murmur3 => Token::Int64(i64::MIN),
            PartitionerKind::Random => Token::BigUint(BigInt::zero()),
            PartitionerKind::ByteOrdered => Token::Bytes(Vec::new()),
        }
    }
}

/// Cassandra's `Murmur3Partitioner` hashes with the 128-bit x64 variant of
/// MurmurHash3 and keeps only the lower 64 bits of the first half,
/// reinterpreted as signed, with `i64::MIN` remapped to `i64::MIN + 1`
/// (the hash output Cassandra itself special-cases since its token ring
/// otherwise couldn't represent "below the minimum token").
fn murmur3_token(data: &[u8]) -> i64 {
    let mut cursor = std::io::Cursor::new(data);
    let hash128 = murmur3::murmur3_x64_128(&mut cursor, 0).expect("reading from an in-memory slice cannot fail");
    let lower64 = hash128 as i64;
    if lower64 == i64::MIN {
        i64::MIN + 1
    } else {
        lower64
    }
}

/// `RandomPartitioner` hashes with MD5 and treats the digest as an unsigned
/// big-endian integer.
fn random_partitioner_token(data: &[u8]) -> BigInt {
    let digest = md5::compute(data);
    BigInt::from_bytes_be(num_bigint::Sign::Plus, &digest.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn murmur3_token_matches_known_vector() {
        // "test" under Cassandra's Murmur3Partitioner: a widely cited
        // reference value used by driver test suites across languages.
        let token = murmur3_token(b"test");
        assert_eq!(token, -6017608668500074083);
    }

    #[test]
    fn murmur3_avoids_i64_min() {
        // Sanity: the remap only matters for a vanishingly unlikely input;
        // we just check the function doesn't panic and stays in range.
        let token = murmur3_token(b"");
        assert_ne!(token, i64::MIN);
    }

    #[test]
    fn byte_ordered_token_is_raw_key() {
        let token = PartitionerKind::ByteOrdered.token_for(b"abc");
        assert_eq!(token, Token::Bytes(b"abc".to_vec()));
    }
}
