//! C2: fixed-capacity set of recent packet fingerprints with FIFO eviction.

use crate::packet::Packet;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};

pub type Fingerprint = [u8; 8];

/// Computes a fingerprint over the immutable fields of a packet: route type,
/// payload type, transport codes, path, sender, and payload. SNR/RSSI
/// (stamped on receipt, not part of the packet's identity) are excluded.
pub fn fingerprint(pkt: &Packet) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(pkt.serialize());
    let digest = hasher.finalize();
    let mut fp = [0u8; 8];
    fp.copy_from_slice(&digest[..8]);
    fp
}

pub struct SeenTable {
    capacity: usize,
    order: VecDeque<Fingerprint>,
    members: HashSet<Fingerprint>,
}

impl SeenTable {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::with_capacity(capacity), members: HashSet::with_capacity(capacity) }
    }

    /// Returns whether `pkt` was already present; if not, inserts it,
    /// evicting the oldest entry when full.
    pub fn check_and_mark(&mut self, pkt: &Packet) -> bool {
        self.check_and_mark_fp(fingerprint(pkt))
    }

    pub fn check_and_mark_fp(&mut self, fp: Fingerprint) -> bool {
        if self.members.contains(&fp) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(fp);
        self.members.insert(fp);
        false
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.members.contains(fp)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
