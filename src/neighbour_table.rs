//! C3: fixed-capacity table of directly-heard identities, LRU-by-timestamp
//! replacement, sorted export. `MAX_NEIGHBOURS == 0` disables the feature
//! entirely — callers hold an `Option<NeighbourTable>` and simply skip it;
//! this type itself always has capacity >= 1.

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighbourRecord {
    pub identity: Identity,
    pub advert_timestamp: u32,
    pub heard_wall_time: u32,
    pub heard_monotonic_ms: u64,
    /// SNR * 4, signed 8-bit.
    pub snr_q2: i8,
}

impl NeighbourRecord {
    fn empty() -> Self {
        Self { identity: Identity::default(), advert_timestamp: 0, heard_wall_time: 0, heard_monotonic_ms: 0, snr_q2: 0 }
    }

    fn is_empty(&self) -> bool {
        self.identity.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
    StrongestFirst,
    WeakestFirst,
}

impl SortOrder {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SortOrder::OldestFirst,
            2 => SortOrder::StrongestFirst,
            3 => SortOrder::WeakestFirst,
            _ => SortOrder::NewestFirst,
        }
    }
}

pub struct NeighbourTable {
    capacity: usize,
    slots: Vec<NeighbourRecord>,
}

fn snr_to_q2(snr: f32) -> i8 {
    (snr * 4.0).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

impl NeighbourTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "NeighbourTable capacity must be >0; use Option<NeighbourTable> to disable");
        Self { capacity, slots: vec![NeighbourRecord::empty(); capacity] }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, id: &Identity) -> Option<&NeighbourRecord> {
        self.slots.iter().find(|r| !r.is_empty() && r.identity == *id)
    }

    /// Updates an existing entry matching `id`; otherwise overwrites the
    /// slot with the smallest `heard_wall_time` (oldest-heard, including
    /// empty slots which sort first via `heard_wall_time == 0`).
    pub fn put(&mut self, id: Identity, advert_ts: u32, snr: f32, wall_now: u32, mono_now_ms: u64) {
        let snr_q2 = snr_to_q2(snr);
        if let Some(existing) = self.slots.iter_mut().find(|r| !r.is_empty() && r.identity == id) {
            existing.advert_timestamp = advert_ts;
            existing.heard_wall_time = wall_now;
            existing.heard_monotonic_ms = mono_now_ms;
            existing.snr_q2 = snr_q2;
            return;
        }
        let victim_idx = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| if r.is_empty() { 0 } else { r.heard_wall_time })
            .map(|(i, _)| i)
            .expect("capacity > 0");
        self.slots[victim_idx] =
            NeighbourRecord { identity: id, advert_timestamp: advert_ts, heard_wall_time: wall_now, heard_monotonic_ms: mono_now_ms, snr_q2 };
    }

    /// Zeroes every slot whose public key starts with `bytes[..len]`.
    pub fn remove_by_prefix(&mut self, bytes: &[u8], len: usize) {
        let len = len.min(bytes.len());
        for slot in self.slots.iter_mut() {
            if !slot.is_empty() && slot.identity.starts_with(&bytes[..len]) {
                *slot = NeighbourRecord::empty();
            }
        }
    }

    fn non_empty(&self) -> impl Iterator<Item = &NeighbourRecord> {
        self.slots.iter().filter(|r| !r.is_empty())
    }

    pub fn count(&self) -> usize {
        self.non_empty().count()
    }

    /// Returns `(prefix, secs_ago, snr_q2)` triples, sorted per `order`,
    /// paginated by `(offset, limit)`. `prefix_len` is clamped to the full
    /// key length.
    pub fn export_sorted(&self, order: SortOrder, limit: usize, offset: usize, prefix_len: usize, wall_now: u32) -> Vec<(Vec<u8>, u32, i8)> {
        let prefix_len = prefix_len.min(crate::identity::PUB_KEY_SIZE);
        let mut rows: Vec<&NeighbourRecord> = self.non_empty().collect();
        rows.sort_by(|a, b| match order {
            SortOrder::NewestFirst => b.heard_wall_time.cmp(&a.heard_wall_time),
            SortOrder::OldestFirst => a.heard_wall_time.cmp(&b.heard_wall_time),
            SortOrder::StrongestFirst => b.snr_q2.cmp(&a.snr_q2),
            SortOrder::WeakestFirst => a.snr_q2.cmp(&b.snr_q2),
        });
        rows.into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| {
                let secs_ago = wall_now.saturating_sub(r.heard_wall_time);
                (r.identity.public_key[..prefix_len].to_vec(), secs_ago, r.snr_q2)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Identity {
        let mut pk = [0u8; 32];
        pk[0] = byte;
        Identity::new(pk)
    }

    #[test]
    fn put_then_get_same_timestamp() {
        let mut t = NeighbourTable::new(4);
        t.put(id(1), 100, 4.0, 1000, 5000);
        let rec = t.get(&id(1)).unwrap();
        assert_eq!(rec.advert_timestamp, 100);
    }

    #[test]
    fn no_two_records_share_identity() {
        let mut t = NeighbourTable::new(4);
        t.put(id(1), 100, 4.0, 1000, 5000);
        t.put(id(1), 200, 5.0, 1100, 5100);
        assert_eq!(t.count(), 1);
        assert_eq!(t.get(&id(1)).unwrap().advert_timestamp, 200);
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut t = NeighbourTable::new(2);
        t.put(id(1), 100, 1.0, 100, 100);
        t.put(id(2), 100, 1.0, 200, 200);
        t.put(id(3), 100, 1.0, 300, 300);
        assert!(t.get(&id(1)).is_none());
        assert!(t.get(&id(2)).is_some());
        assert!(t.get(&id(3)).is_some());
    }

    #[test]
    fn remove_by_prefix_zeroes_matching_slots() {
        let mut t = NeighbourTable::new(4);
        t.put(id(7), 100, 1.0, 100, 100);
        t.remove_by_prefix(&[7], 1);
        assert!(t.get(&id(7)).is_none());
    }

    #[test]
    fn export_sorted_clamps_prefix_len() {
        let mut t = NeighbourTable::new(4);
        t.put(id(1), 100, 1.0, 100, 100);
        let rows = t.export_sorted(SortOrder::NewestFirst, 10, 0, 9999, 200);
        assert_eq!(rows[0].0.len(), crate::identity::PUB_KEY_SIZE);
    }

    #[test]
    fn export_sorted_pagination() {
        let mut t = NeighbourTable::new(4);
        t.put(id(1), 100, 1.0, 100, 100);
        t.put(id(2), 100, 1.0, 200, 200);
        t.put(id(3), 100, 1.0, 300, 300);
        let page = t.export_sorted(SortOrder::NewestFirst, 1, 1, 32, 400);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0[0], 2);
    }
}
