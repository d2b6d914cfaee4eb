use std::vec::IntoIter;

use crate::common::{Contact, Id, MAX_BUCKET_SIZE_K};

#[derive(Debug, Clone)]
/// Contacts sorted by their distance to a target.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Contact>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K * 4),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Contact] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The furthest contact kept so far.
    pub fn furthest(&self) -> Option<&Contact> {
        self.nodes.last()
    }

    // === Public Methods ===

    /// Insert a contact in distance order, ignoring duplicate ids.
    pub fn add(&mut self, node: Contact) {
        let target = self.target;

        if let Err(pos) = self.nodes.binary_search_by(|existing| {
            if existing.id == node.id {
                std::cmp::Ordering::Equal
            } else {
                target.three_way_distance(&existing.id, &node.id)
            }
        }) {
            self.nodes.insert(pos, node)
        }
    }

    /// Drop everything beyond the `k` closest.
    pub fn truncate(&mut self, k: usize) {
        self.nodes.truncate(k)
    }

    /// An estimation of the Dht size from the distribution of the closest
    /// nodes to the target.
    ///
    /// Seeing the `i`th closest node at distance `d_i` suggests about
    /// `i * d_max / d_i` nodes in the whole keyspace. The estimate is the
    /// average of that figure over the first `k` nodes.
    ///
    /// Read more at [A New Method for Estimating P2P Network Size](https://eli.sohl.com/2020/06/05/dht-size-estimation.html)
    pub fn dht_size_estimate(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        };

        let mut sum = 0.0;
        let mut count = 0;

        for node in &self.nodes {
            if count >= MAX_BUCKET_SIZE_K {
                break;
            }

            count += 1;

            let xor = node.id.distance(&self.target);

            let mut top = [0_u8; 16];
            top.copy_from_slice(&xor.as_bytes()[0..16]);

            // Round up the lower 4 bytes to get a u128 from u160.
            let distance = u128::from_be_bytes(top).saturating_add(1);

            let intervals = u128::MAX as f64 / distance as f64;

            sum += intervals * count as f64;
        }

        sum / count as f64
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
