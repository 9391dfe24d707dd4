//! C5: hierarchical named region tree with a reload protocol.
//!
//! Per the REDESIGN FLAGS note on raw-pointer entries, this module never
//! hands out a reference that could be invalidated by a later edit: lookups
//! return a stable 16-bit region ID (an arena index); callers re-resolve by
//! ID between mutating operations.

use std::collections::HashMap;

pub const MAX_REGION_NAME_LEN: usize = 30;
pub const MAX_RELOAD_DEPTH: usize = 7;
pub const WILDCARD_ID: u16 = 0;
pub const DENY_FLOOD: u8 = 0b0000_0001;

const NAME_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_- ";

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_REGION_NAME_LEN && name.chars().all(|c| NAME_CHARSET.contains(c))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionEntry {
    pub id: u16,
    pub name: String,
    pub parent_id: u16,
    pub flags: u8,
}

impl RegionEntry {
    pub fn deny_flood(&self) -> bool {
        self.flags & DENY_FLOOD != 0
    }
}

#[derive(Clone)]
pub struct RegionMap {
    entries: HashMap<u16, RegionEntry>,
    next_id: u16,
    home_id: u16,
}

impl RegionMap {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(WILDCARD_ID, RegionEntry { id: WILDCARD_ID, name: "*".to_string(), parent_id: WILDCARD_ID, flags: 0 });
        Self { entries, next_id: 1, home_id: WILDCARD_ID }
    }

    pub fn find_by_id(&self, id: u16) -> Option<&RegionEntry> {
        self.entries.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<u16> {
        self.entries.values().find(|e| e.name == name).map(|e| e.id)
    }

    pub fn find_by_name_prefix(&self, prefix: &str) -> Vec<u16> {
        let mut ids: Vec<u16> = self.entries.values().filter(|e| e.name.starts_with(prefix)).map(|e| e.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn home(&self) -> u16 {
        self.home_id
    }

    pub fn set_home(&mut self, id: u16) -> bool {
        if self.entries.contains_key(&id) {
            self.home_id = id;
            true
        } else {
            false
        }
    }

    /// Inserts or updates a region. IDs are stable across edits: when `name`
    /// already exists, its ID is preserved and only `parent_id`/flags move.
    pub fn put(&mut self, name: &str, parent_id: u16, flags: u8, id_hint: Option<u16>) -> Option<u16> {
        if !is_valid_name(name) || !self.entries.contains_key(&parent_id) {
            return None;
        }
        if let Some(existing_id) = self.find_by_name(name) {
            if let Some(e) = self.entries.get_mut(&existing_id) {
                e.parent_id = parent_id;
                e.flags = flags;
            }
            return Some(existing_id);
        }
        let id = id_hint.filter(|h| !self.entries.contains_key(h)).unwrap_or_else(|| {
            while self.entries.contains_key(&self.next_id) {
                self.next_id = self.next_id.wrapping_add(1);
            }
            self.next_id
        });
        self.entries.insert(id, RegionEntry { id, name: name.to_string(), parent_id, flags });
        self.next_id = self.next_id.max(id.wrapping_add(1));
        Some(id)
    }

    /// Fails (and leaves the map unchanged) if `id` has any children, or is
    /// the wildcard root (which must always be present per the data model).
    pub fn remove(&mut self, id: u16) -> bool {
        if id == WILDCARD_ID {
            return false;
        }
        if self.entries.values().any(|e| e.parent_id == id && e.id != id) {
            return false;
        }
        self.entries.remove(&id).is_some()
    }

    /// Comma-joined names matching `(flags & mask) == 0` xor `invert`.
    pub fn export_names(&self, mask: u8, invert: bool) -> String {
        let mut names: Vec<&str> = self
            .entries
            .values()
            .filter(|e| {
                let matches = (e.flags & mask) == 0;
                matches ^ invert
            })
            .map(|e| e.name.as_str())
            .collect();
        names.sort_unstable();
        names.join(",")
    }

    /// Writes the truncated, comma-joined export into `buf`, returning the
    /// number of bytes written (embedded wire-format entry point).
    pub fn export_names_into(&self, buf: &mut [u8], mask: u8, invert: bool) -> usize {
        let s = self.export_names(mask, invert);
        let bytes = s.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Resolves transport codes (if present) to a region ID, falling back to
    /// the wildcard root when there is no transport-code key store entry.
    pub fn match_transport(&self, transport_codes: Option<(u16, u16)>, key_store: &HashMap<(u16, u16), u16>) -> u16 {
        match transport_codes.and_then(|codes| key_store.get(&codes).copied()) {
            Some(id) if self.entries.contains_key(&id) => id,
            _ => WILDCARD_ID,
        }
    }

    pub fn deny_check(&self, region_id: u16, mask: u8) -> bool {
        self.entries.get(&region_id).map(|e| e.flags & mask != 0).unwrap_or(false)
    }

    fn snapshot(&self) -> Vec<RegionEntry> {
        let mut v: Vec<RegionEntry> = self.entries.values().cloned().collect();
        v.sort_by_key(|e| e.id);
        v
    }

    /// Binary export for persistence (§6 "Persisted state": format is
    /// implementation-defined).
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = self.snapshot();
        let mut out = Vec::new();
        out.extend_from_slice(&self.home_id.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for e in entries {
            out.extend_from_slice(&e.id.to_le_bytes());
            out.push(e.name.len() as u8);
            out.extend_from_slice(e.name.as_bytes());
            out.extend_from_slice(&e.parent_id.to_le_bytes());
            out.push(e.flags);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let home_id = u16::from_le_bytes(bytes[0..2].try_into().ok()?);
        let count = u32::from_le_bytes(bytes[2..6].try_into().ok()?) as usize;
        let mut idx = 6;
        let mut entries = HashMap::new();
        let mut next_id = 1u16;
        for _ in 0..count {
            if bytes.len() < idx + 2 + 1 {
                return None;
            }
            let id = u16::from_le_bytes(bytes[idx..idx + 2].try_into().ok()?);
            idx += 2;
            let name_len = bytes[idx] as usize;
            idx += 1;
            if bytes.len() < idx + name_len + 2 + 1 {
                return None;
            }
            let name = std::str::from_utf8(&bytes[idx..idx + name_len]).ok()?.to_string();
            idx += name_len;
            let parent_id = u16::from_le_bytes(bytes[idx..idx + 2].try_into().ok()?);
            idx += 2;
            let flags = bytes[idx];
            idx += 1;
            next_id = next_id.max(id.wrapping_add(1));
            entries.insert(id, RegionEntry { id, name, parent_id, flags });
        }
        if !entries.contains_key(&WILDCARD_ID) {
            return None;
        }
        Some(RegionMap { entries, next_id, home_id })
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RegionMap {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot() && self.home_id == other.home_id
    }
}

/// Outcome of submitting one line to a reload session.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Applied,
    Skipped,
    Commit,
}

/// Shadow editing session for the reload protocol: editing the live map
/// mid-session is forbidden, so edits accumulate in `temp_map` until an
/// empty line commits them onto the live map wholesale.
pub struct ReloadSession {
    temp_map: RegionMap,
    /// Last entry ID introduced at each depth (0..=MAX_RELOAD_DEPTH).
    depth_stack: [u16; MAX_RELOAD_DEPTH + 1],
}

impl ReloadSession {
    pub fn begin(live: &RegionMap) -> Self {
        Self { temp_map: live.clone(), depth_stack: [WILDCARD_ID; MAX_RELOAD_DEPTH + 1] }
    }

    /// Parses one reload line. Leading spaces indicate tree depth (0 = child
    /// of wildcard, 1 = child of the last depth-0 entry, ...). Flag "F" means
    /// DENY_FLOOD = 0 (allow flood); its absence means deny.
    pub fn submit_line(&mut self, line: &str) -> LineOutcome {
        if line.trim().is_empty() {
            return LineOutcome::Commit;
        }
        let depth = line.chars().take_while(|c| *c == ' ').count();
        if depth > MAX_RELOAD_DEPTH {
            return LineOutcome::Skipped;
        }
        let rest = line.trim_start();
        let mut parts = rest.split_whitespace();
        let name = match parts.next() {
            Some(n) => n,
            None => return LineOutcome::Skipped,
        };
        let allow_flood = parts.next().map(|f| f.eq_ignore_ascii_case("F")).unwrap_or(false);
        let flags = if allow_flood { 0 } else { DENY_FLOOD };

        let parent_id = if depth == 0 { WILDCARD_ID } else { self.depth_stack[depth - 1] };

        match self.temp_map.put(name, parent_id, flags, None) {
            Some(id) => {
                self.depth_stack[depth] = id;
                LineOutcome::Applied
            }
            None => LineOutcome::Skipped,
        }
    }

    /// Commits the (possibly partial) result onto the live map.
    pub fn commit(self, live: &mut RegionMap) {
        *live = self.temp_map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_root_always_present() {
        let m = RegionMap::new();
        assert_eq!(m.find_by_id(WILDCARD_ID).unwrap().name, "*");
    }

    #[test]
    fn put_preserves_id_on_update() {
        let mut m = RegionMap::new();
        let id1 = m.put("north", WILDCARD_ID, 0, None).unwrap();
        let id2 = m.put("north", WILDCARD_ID, DENY_FLOOD, None).unwrap();
        assert_eq!(id1, id2);
        assert!(m.find_by_id(id1).unwrap().deny_flood());
    }

    #[test]
    fn remove_fails_with_children() {
        let mut m = RegionMap::new();
        let parent = m.put("north", WILDCARD_ID, 0, None).unwrap();
        m.put("north-east", parent, 0, None).unwrap();
        assert!(!m.remove(parent));
        assert!(m.find_by_id(parent).is_some());
    }

    #[test]
    fn remove_succeeds_without_children() {
        let mut m = RegionMap::new();
        let leaf = m.put("east", WILDCARD_ID, 0, None).unwrap();
        assert!(m.remove(leaf));
        assert!(m.find_by_id(leaf).is_none());
    }

    #[test]
    fn export_names_filters_by_mask_and_invert() {
        let mut m = RegionMap::new();
        m.put("open", WILDCARD_ID, 0, None).unwrap();
        m.put("closed", WILDCARD_ID, DENY_FLOOD, None).unwrap();
        let allowed = m.export_names(DENY_FLOOD, false);
        assert!(allowed.contains("open") || allowed.contains('*'));
        assert!(!allowed.split(',').any(|n| n == "closed"));
        let denied = m.export_names(DENY_FLOOD, true);
        assert!(denied.split(',').any(|n| n == "closed"));
    }

    #[test]
    fn to_bytes_from_bytes_round_trip() {
        let mut m = RegionMap::new();
        let north = m.put("north", WILDCARD_ID, DENY_FLOOD, None).unwrap();
        m.put("north-east", north, 0, None).unwrap();
        m.set_home(north);
        let restored = RegionMap::from_bytes(&m.to_bytes()).unwrap();
        assert_eq!(restored, m);
        assert_eq!(restored.home(), north);
    }

    #[test]
    fn reload_protocol_round_trip() {
        let live = RegionMap::new();
        let mut session = ReloadSession::begin(&live);
        assert_eq!(session.submit_line("north F"), LineOutcome::Applied);
        assert_eq!(session.submit_line(" north-east"), LineOutcome::Applied);
        assert_eq!(session.submit_line(""), LineOutcome::Commit);

        let mut committed = live.clone();
        session.commit(&mut committed);

        let north = committed.find_by_name("north").unwrap();
        assert!(!committed.find_by_id(north).unwrap().deny_flood());
        let ne = committed.find_by_name("north-east").unwrap();
        assert_eq!(committed.find_by_id(ne).unwrap().parent_id, north);
    }

    #[test]
    fn reload_skips_malformed_lines_but_keeps_going() {
        let live = RegionMap::new();
        let mut session = ReloadSession::begin(&live);
        assert_eq!(session.submit_line("   way-too-deep-for-this-test-xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"), LineOutcome::Skipped);
        assert_eq!(session.submit_line("north"), LineOutcome::Applied);
        let mut committed = live.clone();
        session.commit(&mut committed);
        assert!(committed.find_by_name("north").is_some());
    }
}
