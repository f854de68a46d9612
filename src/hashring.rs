//! Consistent hash ring
//!
//! Every server is placed on a 32-bit circle at `POINTS_PER_WEIGHT * weight`
//! points. A point's position depends only on the server's ring label and the
//! point index, never on the rest of the server set, so adding or removing a
//! server only moves the keys that land on that server's points.
//!
//! A `HashRing` is immutable once built. Callers swap whole snapshots, which is
//! what makes rebuilds atomic for readers (see `cluster::Topology`).

use crate::cluster::ServerId;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::fmt::Write;

/// Points placed on the ring per unit of weight
pub const POINTS_PER_WEIGHT: u32 = 160;

/// Hash used to place servers and keys on the ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// First four bytes of the MD5 digest
    #[default]
    Md5,
    /// CRC32 (IEEE)
    Crc32,
}

impl HashAlgorithm {
    /// Map arbitrary bytes to a position on the ring
    pub fn hash(self, input: &[u8]) -> u32 {
        match self {
            Self::Md5 => {
                let digest = Md5::digest(input);
                u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
            }
            Self::Crc32 => crc32fast::hash(input),
        }
    }
}

/// Input to a ring build
#[derive(Debug, Clone, Copy)]
pub struct RingNode<'a> {
    /// Name the points are derived from; a fail-over server reuses the label of
    /// the server it replaces so it inherits exactly that server's keys
    pub label: &'a str,
    pub weight: u32,
    pub server: ServerId,
}

/// Immutable snapshot of the ring
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u32, ServerId)>,
    algorithm: HashAlgorithm,
}

impl HashRing {
    /// Build a ring from scratch
    pub fn build<'a>(algorithm: HashAlgorithm, nodes: impl IntoIterator<Item = RingNode<'a>>) -> Self {
        let mut points = Vec::new();
        let mut label = String::new();

        for node in nodes {
            let count = POINTS_PER_WEIGHT * node.weight.max(1);
            for i in 0..count {
                label.clear();
                let _ = write!(label, "{}-{}", node.label, i);
                points.push((algorithm.hash(label.as_bytes()), node.server));
            }
        }

        // Ties on the hash fall back to the server id, so the order is total
        points.sort_unstable();

        Self { points, algorithm }
    }

    /// Server owning the first point clockwise from the key's hash
    pub fn resolve(&self, key: &str) -> Option<ServerId> {
        if self.points.is_empty() {
            return None;
        }
        let hash = self.algorithm.hash(key.as_bytes());
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].1)
    }

    /// Distinct servers present on the ring, ordered by id
    pub fn servers(&self) -> Vec<ServerId> {
        let mut servers: Vec<ServerId> = self.points.iter().map(|(_, s)| *s).collect();
        servers.sort_unstable();
        servers.dedup();
        servers
    }

    /// Number of points on the ring
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
