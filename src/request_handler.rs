//! C8: anonymous-request path, password login, and authenticated admin/guest
//! request/response protocol.

use crate::acl::{ClientStore, ROLE_ADMIN, ROLE_GUEST, is_admin};
use crate::clock::Clock;
use crate::identity::Identity;
use crate::neighbour_table::{NeighbourTable, SortOrder};
use crate::rate_limiter::RateLimiter;
use crate::region_map::{DENY_FLOOD, RegionMap};
use crate::stats::{REPEATER_STATS_WIRE_LEN, RepeaterStats};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const ANON_DISC_REGIONS: u8 = 0x01;
pub const ANON_DISC_OWNER_INFO: u8 = 0x02;
pub const ANON_DISC_CLOCK: u8 = 0x03;

pub const OPCODE_GET_STATUS: u8 = 0x01;
pub const OPCODE_KEEP_ALIVE: u8 = 0x02;
pub const OPCODE_GET_TELEMETRY: u8 = 0x03;
pub const OPCODE_GET_ACCESS_LIST: u8 = 0x05;
pub const OPCODE_GET_NEIGHBOURS: u8 = 0x06;
pub const OPCODE_GET_OWNER_INFO: u8 = 0x07;

pub const RESP_LOGIN_OK: u8 = 0;

pub const TXT_SUBTYPE_CLI: u8 = 0;
pub const TXT_SUBTYPE_PLAIN: u8 = 1;
pub const TXT_SUBTYPE_CLI_DATA: u8 = 2;

pub const CONTROL_NODE_DISCOVER_REQ: u8 = 0x80;
pub const CONTROL_NODE_DISCOVER_RESP: u8 = 0x90;

pub const FEATURE_BIT_BRIDGE_PRESENT: u8 = 0x01;
pub const FEATURE_BIT_BRIDGE_DISABLED: u8 = 0x02;

/// Neighbours list result buffer budget (roughly matches the MTU available
/// after the fixed response header).
const GET_NEIGHBOURS_RESULT_BUDGET: usize = 130;
const ACCESS_LIST_ENTRY_LEN: usize = 7; // 6-byte prefix + 1 perm byte
const ACCESS_LIST_BUDGET: usize = crate::packet::MAX_PAYLOAD - 4;

/// Where a reply should be routed, per §4.7 "Reply routing".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRouting {
    /// Arrived via flood: reply flood-and-path-prime, teaching the
    /// requester a path back.
    FloodWithPathPrime,
    /// Arrived direct with no usable reply path: send flood.
    Flood,
    /// Send direct via this path (the request's explicit reply path, or the
    /// client's cached `out_path`).
    Direct(Vec<u8>),
}

pub fn determine_reply_routing(arrived_via_flood: bool, explicit_reply_path: Option<&[u8]>, cached_out_path: Option<&[u8]>) -> ReplyRouting {
    if arrived_via_flood {
        return ReplyRouting::FloodWithPathPrime;
    }
    if let Some(p) = explicit_reply_path {
        return ReplyRouting::Direct(p.to_vec());
    }
    if let Some(p) = cached_out_path {
        return ReplyRouting::Direct(p.to_vec());
    }
    ReplyRouting::Flood
}

/// The CLI text parser is an external collaborator (spec.md §1); this core
/// only forwards the payload and wraps whatever comes back.
pub trait CliBackend: Send {
    fn handle(&mut self, payload: &[u8]) -> Vec<u8>;
}

fn trim_null(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(i) => &bytes[..i],
        None => bytes,
    }
}

fn derive_shared_secret(sender: &Identity, password: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sender.public_key);
    hasher.update(password);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub struct TxtMsgOutcome {
    pub reply: Vec<u8>,
    pub ack: Option<[u8; 4]>,
}

pub struct RequestHandler {
    pub node_name: String,
    pub owner_info: String,
    pub firmware_level: u8,
    admin_password: Zeroizing<Vec<u8>>,
    guest_password: Zeroizing<Vec<u8>>,
    anon_rate_limiter: RateLimiter,
    discovery_rate_limiter: RateLimiter,
    pub self_identity: Identity,
    pub node_type_bit: u8,
    pub discovery_mod_timestamp: u32,
}

impl RequestHandler {
    pub fn new(node_name: String, owner_info: String, firmware_level: u8, admin_password: &str, guest_password: &str, self_identity: Identity, node_type_bit: u8) -> Self {
        Self {
            node_name,
            owner_info,
            firmware_level,
            admin_password: Zeroizing::new(admin_password.as_bytes().to_vec()),
            guest_password: Zeroizing::new(guest_password.as_bytes().to_vec()),
            anon_rate_limiter: RateLimiter::new(4, 120),
            discovery_rate_limiter: RateLimiter::new(4, 120),
            self_identity,
            node_type_bit,
            discovery_mod_timestamp: 0,
        }
    }

    /// 0 or >= 0x20 is a login attempt. A blank configured password is
    /// acceptable only if the sender is already whitelisted in the ACL.
    pub fn handle_login(&self, sender_ts: u32, password_bytes: &[u8], sender: Identity, arrived_via_flood: bool, acl: &mut ClientStore, clock: &Clock) -> Option<Vec<u8>> {
        let existing = acl.get_by_pubkey(&sender).cloned();
        if let Some(rec) = &existing {
            if sender_ts <= rec.last_timestamp {
                log::debug!("replay detected on login attempt");
                return None;
            }
        }

        let pw = trim_null(password_bytes);
        let is_admin_login = !self.admin_password.is_empty() && pw == self.admin_password.as_slice();
        let is_guest_login = !is_admin_login && !self.guest_password.is_empty() && pw == self.guest_password.as_slice();
        let blank_whitelisted = pw.is_empty() && existing.is_some();

        if !is_admin_login && !is_guest_login && !blank_whitelisted {
            log::debug!("invalid password login attempt");
            return None;
        }

        let perms = if is_admin_login {
            ROLE_ADMIN
        } else if blank_whitelisted {
            existing.as_ref().map(|r| r.permissions).unwrap_or(ROLE_GUEST)
        } else {
            ROLE_GUEST
        };

        let now_wall = clock.wall_now();
        let rec = acl.put(sender, perms, now_wall)?;
        rec.last_timestamp = sender_ts;
        rec.last_activity = now_wall;
        rec.shared_secret = derive_shared_secret(&sender, pw);
        if arrived_via_flood {
            rec.out_path = None;
        }

        let mut reply = Vec::with_capacity(13);
        reply.extend_from_slice(&clock.unique_now().to_le_bytes());
        reply.push(RESP_LOGIN_OK);
        reply.push(0);
        reply.push(is_admin(perms) as u8);
        reply.push(perms);
        reply.extend_from_slice(&crate::clock::random_bytes(4));
        reply.push(self.firmware_level);
        Some(reply)
    }

    /// `{echoed_sender_ts(4), now_wall(4), comma-joined region names}`.
    pub fn handle_regions_request(&mut self, sender_ts: u32, region_map: &RegionMap, clock: &Clock) -> Option<Vec<u8>> {
        if !self.anon_rate_limiter.allow(clock.wall_now()) {
            return None;
        }
        let names = region_map.export_names(DENY_FLOOD, false);
        let mut reply = Vec::with_capacity(8 + names.len());
        reply.extend_from_slice(&sender_ts.to_le_bytes());
        reply.extend_from_slice(&clock.wall_now().to_le_bytes());
        reply.extend_from_slice(names.as_bytes());
        Some(reply)
    }

    /// `{echoed_ts(4), now(4), "node_name\nowner_info"}`.
    pub fn handle_owner_info_request(&mut self, sender_ts: u32, clock: &Clock) -> Option<Vec<u8>> {
        if !self.anon_rate_limiter.allow(clock.wall_now()) {
            return None;
        }
        let text = format!("{}\n{}", self.node_name, self.owner_info);
        let mut reply = Vec::with_capacity(8 + text.len());
        reply.extend_from_slice(&sender_ts.to_le_bytes());
        reply.extend_from_slice(&clock.wall_now().to_le_bytes());
        reply.extend_from_slice(text.as_bytes());
        Some(reply)
    }

    /// `{echoed_ts(4), now(4), feature_bits(1)}`.
    pub fn handle_clock_request(&mut self, sender_ts: u32, bridge_present: bool, bridge_disabled: bool, clock: &Clock) -> Option<Vec<u8>> {
        if !self.anon_rate_limiter.allow(clock.wall_now()) {
            return None;
        }
        let mut feature_bits = 0u8;
        if bridge_present {
            feature_bits |= FEATURE_BIT_BRIDGE_PRESENT;
        }
        if bridge_disabled {
            feature_bits |= FEATURE_BIT_BRIDGE_DISABLED;
        }
        let mut reply = Vec::with_capacity(9);
        reply.extend_from_slice(&sender_ts.to_le_bytes());
        reply.extend_from_slice(&clock.wall_now().to_le_bytes());
        reply.push(feature_bits);
        Some(reply)
    }

    /// Authenticated REQ dispatch. `payload` is `[sender_ts(4)][opcode(1)][args...]`.
    /// Returns `None` for an unknown client, a replayed timestamp, or an
    /// opcode whose reply is optional/denied.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_auth_request(
        &self,
        sender: &Identity,
        payload: &[u8],
        acl: &mut ClientStore,
        neighbours: Option<&NeighbourTable>,
        stats: &RepeaterStats,
        telemetry_full: &[u8],
        telemetry_guest_mask: &[u8],
        clock: &Clock,
    ) -> Option<Vec<u8>> {
        if payload.len() < 5 {
            return None;
        }
        let ts = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let opcode = payload[4];
        let args = &payload[5..];

        let rec = acl.get_by_pubkey(sender)?;
        if ts <= rec.last_timestamp {
            log::debug!("replay detected on auth request");
            return None;
        }
        let perms = rec.permissions;
        acl.bump_timestamp(sender, ts);

        match opcode {
            OPCODE_GET_STATUS => {
                let mut reply = Vec::with_capacity(4 + REPEATER_STATS_WIRE_LEN);
                reply.extend_from_slice(&ts.to_le_bytes());
                reply.extend_from_slice(&stats.to_bytes());
                Some(reply)
            }
            OPCODE_KEEP_ALIVE => {
                if let Some(rec) = acl.get_by_pubkey_mut(sender) {
                    rec.last_activity = clock.wall_now();
                }
                None
            }
            OPCODE_GET_TELEMETRY => {
                let blob = if is_admin(perms) { telemetry_full } else { telemetry_guest_mask };
                let mut reply = Vec::with_capacity(4 + blob.len());
                reply.extend_from_slice(&ts.to_le_bytes());
                reply.extend_from_slice(blob);
                Some(reply)
            }
            OPCODE_GET_ACCESS_LIST => {
                if !is_admin(perms) {
                    return None;
                }
                let mut reply = Vec::with_capacity(4 + ACCESS_LIST_BUDGET);
                reply.extend_from_slice(&ts.to_le_bytes());
                for client in acl.iter_active() {
                    if reply.len() + ACCESS_LIST_ENTRY_LEN - 4 > ACCESS_LIST_BUDGET {
                        break;
                    }
                    reply.extend_from_slice(&client.identity.public_key[..6]);
                    reply.push(client.permissions);
                }
                Some(reply)
            }
            OPCODE_GET_NEIGHBOURS => self.handle_get_neighbours(ts, args, neighbours, clock),
            OPCODE_GET_OWNER_INFO => {
                let text = format!("v{}\n{}\n{}", self.firmware_level, self.node_name, self.owner_info);
                let mut reply = Vec::with_capacity(4 + text.len());
                reply.extend_from_slice(&ts.to_le_bytes());
                reply.extend_from_slice(text.as_bytes());
                Some(reply)
            }
            _ => None,
        }
    }

    fn handle_get_neighbours(&self, ts: u32, args: &[u8], neighbours: Option<&NeighbourTable>, clock: &Clock) -> Option<Vec<u8>> {
        if args.len() < 9 {
            return None;
        }
        let count = args[0] as usize;
        let offset = u16::from_le_bytes([args[1], args[2]]) as usize;
        let order = SortOrder::from_u8(args[3]);
        let prefix_len = args[4] as usize;
        // args[5..9] is opaque random ballast (§9 Open Questions).

        let table = neighbours?;
        let wall_now = clock.wall_now();
        let rows = table.export_sorted(order, count, offset, prefix_len, wall_now);
        let total = table.count() as u16;

        let mut body = Vec::new();
        let mut returned: u16 = 0;
        for (prefix, secs_ago, snr_q2) in rows {
            let entry_len = prefix.len() + 4 + 1;
            if body.len() + entry_len > GET_NEIGHBOURS_RESULT_BUDGET {
                break;
            }
            body.extend_from_slice(&prefix);
            body.extend_from_slice(&secs_ago.to_le_bytes());
            body.push(snr_q2 as u8);
            returned += 1;
        }

        let mut reply = Vec::with_capacity(8 + body.len());
        reply.extend_from_slice(&ts.to_le_bytes());
        reply.extend_from_slice(&total.to_le_bytes());
        reply.extend_from_slice(&returned.to_le_bytes());
        reply.extend_from_slice(&body);
        Some(reply)
    }

    /// On PATH from a known peer, copy the path into `out_path`; never echo
    /// a reciprocal path.
    pub fn handle_path(&self, sender: &Identity, path: &[u8], acl: &mut ClientStore, clock: &Clock) {
        if let Some(rec) = acl.get_by_pubkey_mut(sender) {
            rec.out_path = Some(path.to_vec());
            rec.last_activity = clock.wall_now();
        }
    }

    /// TXT_MSG from an admin client. `payload` is
    /// `[sender_ts(4)][subtype(1)][text...]`. Returns `None` for a
    /// non-admin/unknown sender or a true replay (`ts < last_ts`); a retry
    /// (`ts == last_ts`) yields an empty reply without re-invoking the CLI.
    pub fn handle_admin_txt(&self, sender: &Identity, sender_pubkey: &[u8; 32], payload: &[u8], acl: &mut ClientStore, cli: &mut dyn CliBackend, clock: &Clock) -> Option<TxtMsgOutcome> {
        if payload.len() < 5 {
            return None;
        }
        let ts = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let subtype = payload[4];
        let text = &payload[5..];

        let rec = acl.get_by_pubkey(sender)?;
        if !is_admin(rec.permissions) {
            return None;
        }
        if ts < rec.last_timestamp {
            log::debug!("replay detected on admin text message");
            return None;
        }
        if ts == rec.last_timestamp {
            return Some(TxtMsgOutcome { reply: Vec::new(), ack: None });
        }
        acl.bump_timestamp(sender, ts);

        let cli_reply = cli.handle(text);
        let mut reply = Vec::with_capacity(5 + cli_reply.len());
        reply.extend_from_slice(&clock.unique_now().to_le_bytes());
        reply.push(TXT_SUBTYPE_CLI_DATA);
        reply.extend_from_slice(&cli_reply);

        let ack = if subtype == TXT_SUBTYPE_PLAIN { Some(compute_ack(ts, text, sender_pubkey)) } else { None };
        Some(TxtMsgOutcome { reply, ack })
    }

    /// CONTROL packets with upper nibble NODE_DISCOVER_REQ.
    pub fn handle_discovery(&mut self, payload: &[u8], inbound_snr_q2: i8, forwarding_enabled: bool, node_role_bits: u8, now_wall: u32) -> Option<Vec<u8>> {
        if payload.is_empty() || payload[0] & 0xF0 != CONTROL_NODE_DISCOVER_REQ {
            return None;
        }
        if payload.len() < 6 {
            return None;
        }
        let filter_mask = payload[1];
        let tag = u32::from_le_bytes(payload[2..6].try_into().unwrap());
        let since = if payload.len() >= 10 { Some(u32::from_le_bytes(payload[6..10].try_into().unwrap())) } else { None };

        if filter_mask & self.node_type_bit == 0 {
            return None;
        }
        if !forwarding_enabled {
            return None;
        }
        if !self.discovery_rate_limiter.allow(now_wall) {
            return None;
        }
        if let Some(since) = since {
            if self.discovery_mod_timestamp < since {
                return None;
            }
        }

        let prefix_only = payload[0] & 1 != 0;
        let pubkey_field: &[u8] = if prefix_only { &self.self_identity.public_key[..6] } else { &self.self_identity.public_key };

        let mut reply = Vec::with_capacity(2 + 4 + pubkey_field.len());
        reply.push(CONTROL_NODE_DISCOVER_RESP | (node_role_bits & 0x0F));
        reply.push(inbound_snr_q2 as u8);
        reply.extend_from_slice(&tag.to_le_bytes());
        reply.extend_from_slice(pubkey_field);
        Some(reply)
    }
}

fn compute_ack(sender_ts: u32, text: &[u8], sender_pubkey: &[u8; 32]) -> [u8; 4] {
    let mut hasher = Sha256::new();
    hasher.update(sender_ts.to_le_bytes());
    hasher.update(text);
    hasher.update(sender_pubkey);
    let digest = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}
