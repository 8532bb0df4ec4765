//! Consistent hash ring
//!
//! Each node is placed on a 32-bit ring at [`VIRTUAL_NODES`] points, hashed
//! from `"{name}-{i}"`. A key maps to the first point at or after its own
//! hash, wrapping to the lowest point. Removing a node only remaps the keys
//! that landed on that node's points.

/// Points per node on the ring
pub const VIRTUAL_NODES: usize = 250;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1 with a final avalanche mix
pub fn modified_fnv1_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
    }

    hash = hash.wrapping_add(hash << 13);
    hash ^= hash >> 7;
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 17;
    hash = hash.wrapping_add(hash << 5);
    hash
}

/// Immutable ring; rebuild it whenever membership changes
#[derive(Debug, Clone)]
pub struct HashRing<T> {
    points: Vec<(u32, T)>,
}

impl<T: Clone> HashRing<T> {
    pub fn build<'a, I>(nodes: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = (&'a str, T)>,
    {
        let mut points = Vec::new();
        for (name, value) in nodes {
            for i in 0..virtual_nodes {
                let hash = modified_fnv1_hash(format!("{}-{}", name, i).as_bytes());
                points.push((hash, value.clone()));
            }
        }
        // Stable: colliding points keep insertion order
        points.sort_by_key(|(hash, _)| *hash);
        Self { points }
    }
}

impl<T> HashRing<T> {
    pub fn empty() -> Self {
        Self { points: Vec::new() }
    }

    /// Node owning `key`, or `None` on an empty ring
    pub fn get(&self, key: &str) -> Option<&T> {
        self.get_by_hash(modified_fnv1_hash(key.as_bytes()))
    }

    pub fn get_by_hash(&self, hash: u32) -> Option<&T> {
        if self.points.is_empty() {
            return None;
        }
        let index = self.points.partition_point(|(point, _)| *point < hash);
        let index = if index == self.points.len() { 0 } else { index };
        Some(&self.points[index].1)
    }

    /// Number of points (nodes × virtual nodes)
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl<T> Default for HashRing<T> {
    fn default() -> Self {
        Self::empty()
    }
}
