//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub const MIN: Id = Id([0; ID_SIZE]);
    pub const MAX: Id = Id([0xff; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// XOR distance between this Id and a target Id.
    pub fn distance(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Decides which of `a` and `b` is closer to `self` without building the
    /// full distances.
    ///
    /// Returns [Ordering::Less] if `a` is closer, [Ordering::Greater] if `b` is
    /// closer and [Ordering::Equal] if `a == b`.
    pub fn three_way_distance(&self, a: &Id, b: &Id) -> Ordering {
        for i in 0..ID_SIZE {
            let da = a.0[i] ^ self.0[i];
            let db = b.0[i] ^ self.0[i];

            if da != db {
                return da.cmp(&db);
            }
        }

        Ordering::Equal
    }

    /// Number of leading bits shared with `other`, 160 if equal.
    pub fn leading_matching_bits(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let x = self.0[i] ^ other.0[i];

            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// First four bytes as a big endian integer.
    pub fn top_u32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| Error::InvalidIdEncoding(s.to_string()))?;

            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Id::from_bytes([0_u8; 19]),
            Err(Error::InvalidIdSize(19))
        ));
        assert!(Id::from_bytes([0_u8; 21]).is_err());
        assert!(Id::from_bytes([7_u8; 20]).is_ok());
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::from_str("5a3ce9c14e7a08645677bbd1cfe7d8f956d53256").unwrap();

        assert_eq!(id.to_string(), "5a3ce9c14e7a08645677bbd1cfe7d8f956d53256");
        assert!(Id::from_str("5a3ce9c14e7a08645677bbd1cfe7d8f956d5325").is_err());
        assert!(Id::from_str("zz3ce9c14e7a08645677bbd1cfe7d8f956d53256").is_err());
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), Id::MIN);
    }

    #[test]
    fn three_way_distance_agrees_with_full_distance() {
        for _ in 0..10_000 {
            let h = Id::random();
            let mut a = Id::random();
            let mut b = Id::random();

            // Force long shared prefixes now and then, so the later bytes decide.
            if rand::random::<bool>() {
                a.0[..10].copy_from_slice(&h.0[..10]);
                b.0[..10].copy_from_slice(&h.0[..10]);
            }

            assert_eq!(
                h.three_way_distance(&a, &b),
                h.distance(&a).cmp(&h.distance(&b))
            );
        }

        let h = Id::random();
        let a = Id::random();
        assert_eq!(h.three_way_distance(&a, &a), Ordering::Equal);
    }

    #[test]
    fn leading_matching_bits() {
        let a = Id([0; 20]);
        let mut b = Id([0; 20]);
        b.0[1] = 0b0001_0000;

        assert_eq!(a.leading_matching_bits(&b), 11);
        assert_eq!(a.leading_matching_bits(&a), ID_BITS);
        assert!(b.bit(11));
        assert!(!b.bit(10));
    }
}
