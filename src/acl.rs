//! C4: persisted table of known clients (ACL / ClientStore).

use crate::identity::Identity;

pub const ROLE_MASK: u8 = 0b0000_0011;
pub const ROLE_NONE: u8 = 0;
pub const ROLE_GUEST: u8 = 1;
pub const ROLE_ADMIN: u8 = 2;
/// Feature flag bits live above the 2-bit role field.
pub const FEATURE_TELEMETRY_FULL: u8 = 0x10;

pub fn role_of(permissions: u8) -> u8 {
    permissions & ROLE_MASK
}

pub fn is_admin(permissions: u8) -> bool {
    role_of(permissions) == ROLE_ADMIN
}

pub fn is_guest_or_better(permissions: u8) -> bool {
    role_of(permissions) != ROLE_NONE
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub identity: Identity,
    pub permissions: u8,
    pub shared_secret: [u8; 32],
    /// Monotonic sender timestamp floor; replay guard. Never decreases.
    pub last_timestamp: u32,
    pub last_activity: u32,
    /// `None` means "unknown" (the wire `-1` length sentinel).
    pub out_path: Option<Vec<u8>>,
}

impl ClientRecord {
    fn new(identity: Identity, permissions: u8, now: u32) -> Self {
        Self { identity, permissions, shared_secret: [0u8; 32], last_timestamp: 0, last_activity: now, out_path: None }
    }

    /// A record with permissions == 0 is a tombstone, skipped on enumeration.
    pub fn is_tombstone(&self) -> bool {
        self.permissions == 0
    }
}

pub struct ClientStore {
    capacity: usize,
    records: Vec<ClientRecord>,
    dirty: bool,
}

impl ClientStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, records: Vec::with_capacity(capacity), dirty: false }
    }

    pub fn get_by_pubkey(&self, pk: &Identity) -> Option<&ClientRecord> {
        self.records.iter().find(|r| r.identity == *pk && !r.is_tombstone())
    }

    pub fn get_by_pubkey_mut(&mut self, pk: &Identity) -> Option<&mut ClientRecord> {
        self.records.iter_mut().find(|r| r.identity == *pk && !r.is_tombstone())
    }

    /// Returns the existing record for `identity` (updating its role if it
    /// already exists) or creates a new one. Returns `None` only if the
    /// table is full and no tombstone slot is available for reuse.
    pub fn put(&mut self, identity: Identity, role_bits: u8, now: u32) -> Option<&mut ClientRecord> {
        if let Some(idx) = self.records.iter().position(|r| r.identity == identity) {
            let rec = &mut self.records[idx];
            rec.permissions = role_bits;
            self.dirty = true;
            return Some(&mut self.records[idx]);
        }
        if let Some(idx) = self.records.iter().position(|r| r.is_tombstone()) {
            self.records[idx] = ClientRecord::new(identity, role_bits, now);
            self.dirty = true;
            return Some(&mut self.records[idx]);
        }
        if self.records.len() >= self.capacity {
            return None;
        }
        self.records.push(ClientRecord::new(identity, role_bits, now));
        self.dirty = true;
        self.records.last_mut()
    }

    /// Policy decision used by admin commands: `self_identity` is excluded
    /// from matching; the target is looked up by prefix. `new_perms == 0`
    /// tombstones the entry.
    pub fn apply_permissions(&mut self, self_identity: &Identity, pk_prefix: &[u8], len: usize, new_perms: u8) -> bool {
        let len = len.min(pk_prefix.len());
        if let Some(rec) = self
            .records
            .iter_mut()
            .find(|r| !r.is_tombstone() && r.identity != *self_identity && r.identity.starts_with(&pk_prefix[..len]))
        {
            rec.permissions = new_perms;
            self.dirty = true;
            true
        } else {
            false
        }
    }

    /// Every non-tombstoned record whose identity's hash byte matches.
    pub fn search_by_hash(&self, hash: u8) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_tombstone() && r.identity.matches_hash(hash))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn get_index(&self, idx: usize) -> Option<&ClientRecord> {
        self.records.get(idx).filter(|r| !r.is_tombstone())
    }

    /// Enforces strict monotonicity of `last_timestamp`: it never decreases.
    pub fn bump_timestamp(&mut self, pk: &Identity, ts: u32) {
        if let Some(rec) = self.get_by_pubkey_mut(pk) {
            if ts > rec.last_timestamp {
                rec.last_timestamp = ts;
            }
        }
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.iter().filter(|r| !r.is_tombstone())
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Binary export for persistence (§6 "Persisted state": format is
    /// implementation-defined, atomic replacement is the only requirement).
    /// Tombstones are dropped; they carry no information worth persisting.
    pub fn to_bytes(&self) -> Vec<u8> {
        let active: Vec<&ClientRecord> = self.iter_active().collect();
        let mut out = Vec::new();
        out.extend_from_slice(&(active.len() as u32).to_le_bytes());
        for rec in active {
            out.extend_from_slice(&rec.identity.public_key);
            out.push(rec.permissions);
            out.extend_from_slice(&rec.shared_secret);
            out.extend_from_slice(&rec.last_timestamp.to_le_bytes());
            out.extend_from_slice(&rec.last_activity.to_le_bytes());
            match &rec.out_path {
                None => out.push(0xFF),
                Some(p) => {
                    out.push(p.len() as u8);
                    out.extend_from_slice(p);
                }
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], capacity: usize) -> Option<Self> {
        let mut store = ClientStore::new(capacity);
        if bytes.len() < 4 {
            return None;
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
        let mut idx = 4;
        for _ in 0..count {
            if bytes.len() < idx + 32 + 1 + 32 + 4 + 4 + 1 {
                return None;
            }
            let mut pk = [0u8; 32];
            pk.copy_from_slice(&bytes[idx..idx + 32]);
            idx += 32;
            let permissions = bytes[idx];
            idx += 1;
            let mut shared_secret = [0u8; 32];
            shared_secret.copy_from_slice(&bytes[idx..idx + 32]);
            idx += 32;
            let last_timestamp = u32::from_le_bytes(bytes[idx..idx + 4].try_into().ok()?);
            idx += 4;
            let last_activity = u32::from_le_bytes(bytes[idx..idx + 4].try_into().ok()?);
            idx += 4;
            let path_len = bytes[idx];
            idx += 1;
            let out_path = if path_len == 0xFF {
                None
            } else {
                let len = path_len as usize;
                if bytes.len() < idx + len {
                    return None;
                }
                let p = bytes[idx..idx + len].to_vec();
                idx += len;
                Some(p)
            };
            store.records.push(ClientRecord { identity: Identity::new(pk), permissions, shared_secret, last_timestamp, last_activity, out_path });
        }
        Some(store)
    }
}
