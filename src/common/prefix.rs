//! Keyspace partitions: an [Id] truncated to a bit depth.
use std::fmt::{self, Debug, Display, Formatter};

use super::id::{Id, ID_BITS, ID_SIZE};

/// The deepest a prefix can go, covering a single key.
pub const MAX_DEPTH: i16 = ID_BITS as i16 - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A key plus a depth, covering every key whose first `depth + 1` bits equal
/// those of `base`.
///
/// Bits after `depth` are always zero, so two prefixes covering the same
/// keys compare equal, and sorting by base sorts disjoint prefixes in
/// keyspace order.
pub struct Prefix {
    base: Id,
    depth: i16,
}

impl Prefix {
    /// The prefix matching every key.
    pub const WHOLE_KEYSPACE: Prefix = Prefix {
        base: Id::MIN,
        depth: -1,
    };

    /// Create a prefix from the first `depth + 1` bits of `id`.
    pub fn new(id: Id, depth: i16) -> Prefix {
        let depth = depth.clamp(-1, MAX_DEPTH);

        Prefix {
            base: mask_after(id, depth),
            depth,
        }
    }

    pub fn depth(&self) -> i16 {
        self.depth
    }

    /// The lowest key covered by this prefix.
    pub fn first(&self) -> Id {
        self.base
    }

    /// The highest key covered by this prefix.
    pub fn last(&self) -> Id {
        let mut last = self.base;
        for bit in (self.depth + 1) as usize..ID_BITS {
            last.0[bit / 8] |= 0x80 >> (bit % 8);
        }
        last
    }

    pub fn is_prefix_of(&self, id: &Id) -> bool {
        self.depth < 0 || self.base.leading_matching_bits(id) > self.depth as usize
    }

    /// Whether this prefix covers every key covered by `other`.
    pub fn covers(&self, other: &Prefix) -> bool {
        self.depth <= other.depth && self.is_prefix_of(&other.base)
    }

    pub fn split_prefix_branch(&self, high_branch: bool) -> Prefix {
        let depth = self.depth + 1;
        let mut base = self.base;

        if high_branch {
            let bit = depth as usize;
            base.0[bit / 8] |= 0x80 >> (bit % 8);
        }

        Prefix { base, depth }
    }

    /// The prefix one bit shorter, or the whole keyspace for the whole keyspace.
    pub fn parent(&self) -> Prefix {
        if self.depth < 0 {
            return *self;
        }

        Prefix::new(self.base, self.depth - 1)
    }

    /// Same depth, different last bit, same parent.
    pub fn is_sibling_of(&self, other: &Prefix) -> bool {
        self.depth >= 0
            && self.depth == other.depth
            && self != other
            && self.parent() == other.parent()
    }

    /// A uniformly random key inside this prefix.
    pub fn create_random_key_from_prefix(&self) -> Id {
        let mut key = Id::random();

        let bits = (self.depth + 1) as usize;
        let full_bytes = bits / 8;

        key.0[..full_bytes].copy_from_slice(&self.base.0[..full_bytes]);

        if full_bytes < ID_SIZE && bits % 8 != 0 {
            let mask = 0xff_u8 << (8 - bits % 8);
            key.0[full_bytes] = (self.base.0[full_bytes] & mask) | (key.0[full_bytes] & !mask);
        }

        key
    }
}

fn mask_after(mut id: Id, depth: i16) -> Id {
    for bit in (depth + 1) as usize..ID_BITS {
        id.0[bit / 8] &= !(0x80 >> (bit % 8));
    }
    id
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.depth < 0 {
            return write!(f, "all");
        }

        for bit in 0..=self.depth as usize {
            write!(f, "{}", if self.base.bit(bit) { '1' } else { '0' })?;
            if bit % 4 == 3 && bit != self.depth as usize {
                write!(f, "_")?;
            }
        }

        Ok(())
    }
}

impl Debug for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({}/{})", self, self.depth)
    }
}
