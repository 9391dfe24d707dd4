//! C11: loop-suppressing bidirectional relay between the radio plane and a
//! byte-oriented backhaul, plus ban-list enforcement and the in-band self-ban
//! command. Grounded on `examples/original_source/src/helpers/bridges/MQTTBridge.h`,
//! generalised off its concrete MQTT/WiFi specifics onto the abstract
//! `BridgeTransport` contract.

use crate::config::Prefs;
use crate::packet::{Packet, PayloadType};
use crate::persistence::{PersistKind, Persistence};
use crate::seen_table::{SeenTable, fingerprint};
use crate::transport::BridgeTransport;

pub const BAN_LIST_SIZE: usize = 16;
pub const BAN_CMD_MAGIC: [u8; 3] = [0xBA, 0x4E, 0xED];
pub const BAN_CMD_LEN: usize = 7;

/// Minimum spacing between reconnect attempts, mirroring the original's
/// `_lastReconnectAttempt` debounce.
pub const RECONNECT_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub tx_packets: u32,
    pub rx_packets: u32,
    pub tx_filtered: u32,
    pub rx_banned: u32,
    pub reconnects: u32,
}

/// Fixed-capacity list of banned public-key prefixes.
pub struct BanList {
    prefixes: Vec<[u8; 4]>,
}

impl BanList {
    pub fn new() -> Self {
        Self { prefixes: Vec::with_capacity(BAN_LIST_SIZE) }
    }

    pub fn contains(&self, prefix: &[u8; 4]) -> bool {
        self.prefixes.contains(prefix)
    }

    pub fn matches_hash_byte(&self, hash_byte: u8) -> bool {
        self.prefixes.iter().any(|p| p[0] == hash_byte)
    }

    /// Returns whether the prefix was newly added (false if already present
    /// or the list is full).
    pub fn add(&mut self, prefix: [u8; 4]) -> bool {
        if self.prefixes.contains(&prefix) || self.prefixes.len() >= BAN_LIST_SIZE {
            return false;
        }
        self.prefixes.push(prefix);
        true
    }

    pub fn remove(&mut self, prefix: &[u8; 4]) -> bool {
        if let Some(idx) = self.prefixes.iter().position(|p| p == prefix) {
            self.prefixes.swap_remove(idx);
            true
        } else {
            false
        }
    }

    pub fn export_str(&self) -> String {
        let mut hexes: Vec<String> = self.prefixes.iter().map(|p| hex4(p)).collect();
        hexes.sort_unstable();
        hexes.join(",")
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

fn hex4(prefix: &[u8; 4]) -> String {
    prefix.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct BridgeCore {
    seen: SeenTable,
    ban_list: BanList,
    stats: BridgeStats,
    running: bool,
    self_pubkey_prefix: [u8; 4],
    deferred_self_ban: bool,
    next_reconnect_at_ms: u64,
}

impl BridgeCore {
    pub fn new(self_pubkey_prefix: [u8; 4], seen_capacity: usize) -> Self {
        Self {
            seen: SeenTable::new(seen_capacity),
            ban_list: BanList::new(),
            stats: BridgeStats::default(),
            running: false,
            self_pubkey_prefix,
            deferred_self_ban: false,
            next_reconnect_at_ms: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn ban_list_str(&self) -> String {
        self.ban_list.export_str()
    }

    pub fn status_line(&self) -> String {
        format!(
            "bridge: {} tx={} rx={} filtered={} rx_banned={} reconnects={}",
            if self.running { "up" } else { "down" },
            self.stats.tx_packets,
            self.stats.rx_packets,
            self.stats.tx_filtered,
            self.stats.rx_banned,
            self.stats.reconnects
        )
    }

    /// Starts (or restarts) the bridge. Refused while self-banned until the
    /// operator has set non-default credentials and topic; a successful
    /// connect while banned clears `mqtt_banned` automatically.
    pub fn start(&mut self, transport: &mut dyn BridgeTransport, prefs: &mut Prefs, persistence: &mut Persistence, now_ms: u64) -> bool {
        if prefs.mqtt_banned && !prefs.has_valid_mqtt_credentials() {
            return false;
        }
        if !transport.connect() {
            return false;
        }
        self.running = true;
        self.stats.reconnects += 1;
        if prefs.mqtt_banned {
            prefs.mqtt_banned = false;
            persistence.mark_dirty(PersistKind::Prefs, now_ms);
        }
        true
    }

    /// Stops the bridge only; any underlying transport connection beneath
    /// it (e.g. WiFi) is left up, matching the original's `stopMQTT`.
    pub fn stop(&mut self, transport: &mut dyn BridgeTransport) {
        transport.disconnect();
        self.running = false;
    }

    /// Stops the bridge and any transport-level connection beneath it. Under
    /// `BridgeTransport`'s abstraction there is no separate link to tear
    /// down beyond `disconnect`, so this currently coincides with `stop`;
    /// kept distinct to preserve the `begin`/`end`/`endAll` lifecycle shape.
    pub fn stop_all(&mut self, transport: &mut dyn BridgeTransport) {
        self.stop(transport);
    }

    /// Coalescing reconnect attempt, called once per loop iteration while
    /// the bridge is not running.
    pub fn poll_reconnect(&mut self, transport: &mut dyn BridgeTransport, prefs: &mut Prefs, persistence: &mut Persistence, now_ms: u64) {
        if self.running || !prefs.bridge_autostart {
            return;
        }
        if now_ms < self.next_reconnect_at_ms {
            return;
        }
        self.next_reconnect_at_ms = now_ms + RECONNECT_BACKOFF_MS;
        self.start(transport, prefs, persistence, now_ms);
    }

    /// Excludes TRACE packets and zero-hop ADVERTs (meaningful only to
    /// direct RF neighbours).
    pub fn should_bridge_packet(pkt: &Packet) -> bool {
        !(pkt.payload_type == PayloadType::Trace || (pkt.payload_type == PayloadType::Advert && pkt.path_len() == 0))
    }

    /// Called on every locally-transmitted packet. Publishes unless
    /// filtered by `should_bridge_packet` or already seen (meaning it
    /// arrived via the backhaul and must not be echoed back to it).
    pub fn on_local_packet(&mut self, pkt: &Packet, transport: &mut dyn BridgeTransport) {
        if !self.running {
            return;
        }
        if !Self::should_bridge_packet(pkt) {
            self.stats.tx_filtered += 1;
            return;
        }
        if self.seen.check_and_mark_fp(fingerprint(pkt)) {
            return;
        }
        transport.publish(&pkt.serialize());
        self.stats.tx_packets += 1;
    }

    /// Called with one message received from the backhaul. Returns the
    /// packet to inject into the local mesh, or `None` if it was a ban
    /// command, banned, malformed, or the bridge is stopped.
    pub fn on_backhaul_message(&mut self, bytes: &[u8]) -> Option<Packet> {
        if !self.running {
            return None;
        }
        if bytes.len() == BAN_CMD_LEN && bytes[0..3] == BAN_CMD_MAGIC {
            let target = [bytes[3], bytes[4], bytes[5], bytes[6]];
            if target == self.self_pubkey_prefix {
                self.deferred_self_ban = true;
            }
            return None;
        }

        let pkt = Packet::deserialize(bytes)?;
        if self.is_banned(&pkt) {
            self.stats.rx_banned += 1;
            return None;
        }
        self.seen.check_and_mark_fp(fingerprint(&pkt));
        self.stats.rx_packets += 1;
        Some(pkt)
    }

    fn is_banned(&self, pkt: &Packet) -> bool {
        match pkt.payload_type {
            PayloadType::Advert => pkt.advert_prefix().is_some_and(|p| self.ban_list.contains(&p)),
            PayloadType::TxtMsg | PayloadType::Req | PayloadType::Response | PayloadType::Path => {
                pkt.source_hash_byte().is_some_and(|h| self.ban_list.matches_hash_byte(h))
            }
            _ => false,
        }
    }

    pub fn take_deferred_self_ban(&mut self) -> bool {
        std::mem::replace(&mut self.deferred_self_ban, false)
    }

    /// Wipes mqtt credentials/topic in `prefs`, sets `mqtt_banned`, persists,
    /// and stops the bridge. Run from the main loop in response to
    /// `take_deferred_self_ban` — never from the transport callback context.
    pub fn execute_self_ban(&mut self, transport: &mut dyn BridgeTransport, prefs: &mut Prefs, persistence: &mut Persistence, now_ms: u64) {
        self.stop(transport);
        prefs.clear_mqtt_credentials();
        persistence.mark_dirty(PersistKind::Prefs, now_ms);
    }

    /// Appends `prefix` if new and room remains, then always publishes a ban
    /// command for it (even if the list was already full), so other sites
    /// can ban their own copy.
    pub fn ban(&mut self, prefix: [u8; 4], transport: &mut dyn BridgeTransport) {
        self.ban_list.add(prefix);
        self.send_ban_command(prefix, transport);
    }

    pub fn unban(&mut self, prefix: [u8; 4]) -> bool {
        self.ban_list.remove(&prefix)
    }

    fn send_ban_command(&self, prefix: [u8; 4], transport: &mut dyn BridgeTransport) {
        let mut frame = Vec::with_capacity(BAN_CMD_LEN);
        frame.extend_from_slice(&BAN_CMD_MAGIC);
        frame.extend_from_slice(&prefix);
        transport.publish(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RouteType;

    #[derive(Default)]
    struct FakeTransport {
        connected: bool,
        connect_should_succeed: bool,
        published: Vec<Vec<u8>>,
    }

    impl BridgeTransport for FakeTransport {
        fn publish(&mut self, bytes: &[u8]) {
            self.published.push(bytes.to_vec());
        }
        fn try_recv(&mut self) -> Option<Vec<u8>> {
            None
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn disconnect(&mut self) {
            self.connected = false;
        }
        fn connect(&mut self) -> bool {
            self.connected = self.connect_should_succeed;
            self.connected
        }
    }

    fn started_bridge() -> (BridgeCore, FakeTransport, Prefs, Persistence) {
        let mut bridge = BridgeCore::new([1, 2, 3, 4], 16);
        let mut transport = FakeTransport { connect_should_succeed: true, ..Default::default() };
        let mut prefs = Prefs::default();
        let mut persistence = Persistence::new(1000);
        assert!(bridge.start(&mut transport, &mut prefs, &mut persistence, 0));
        (bridge, transport, prefs, persistence)
    }

    #[test]
    fn zero_hop_advert_is_filtered_from_bridging() {
        let (mut bridge, mut transport, ..) = started_bridge();
        let pkt = Packet::new(PayloadType::Advert, RouteType::Flood);
        bridge.on_local_packet(&pkt, &mut transport);
        assert!(transport.published.is_empty());
        assert_eq!(bridge.stats().tx_filtered, 1);
    }

    #[test]
    fn packet_already_seen_via_backhaul_is_not_republished() {
        let (mut bridge, mut transport, ..) = started_bridge();
        let pkt = Packet::new(PayloadType::TxtMsg, RouteType::Flood).with_payload(vec![1, 2]);
        let bytes = pkt.serialize();

        // arrives via backhaul first
        assert!(bridge.on_backhaul_message(&bytes).is_some());
        // now locally "transmitted" (e.g. re-sent after injection): must not loop back out
        bridge.on_local_packet(&pkt, &mut transport);
        assert!(transport.published.is_empty());
    }

    #[test]
    fn fresh_local_packet_is_published_and_marked_seen() {
        let (mut bridge, mut transport, ..) = started_bridge();
        let pkt = Packet::new(PayloadType::TxtMsg, RouteType::Flood).with_payload(vec![9]);
        bridge.on_local_packet(&pkt, &mut transport);
        assert_eq!(transport.published.len(), 1);
        assert_eq!(bridge.stats().tx_packets, 1);
    }

    #[test]
    fn ban_command_sets_deferred_flag_and_is_not_injected() {
        let (mut bridge, ..) = started_bridge();
        let mut frame = vec![0xBA, 0x4E, 0xED];
        frame.extend_from_slice(&[1, 2, 3, 4]);
        assert!(bridge.on_backhaul_message(&frame).is_none());
        assert!(bridge.take_deferred_self_ban());
        assert!(!bridge.take_deferred_self_ban(), "flag should clear after being taken");
    }

    #[test]
    fn ban_command_for_another_node_is_ignored() {
        let (mut bridge, ..) = started_bridge();
        let mut frame = vec![0xBA, 0x4E, 0xED];
        frame.extend_from_slice(&[9, 9, 9, 9]);
        assert!(bridge.on_backhaul_message(&frame).is_none());
        assert!(!bridge.take_deferred_self_ban());
    }

    #[test]
    fn banned_source_hash_drops_txt_msg() {
        let (mut bridge, ..) = started_bridge();
        bridge.ban([7, 0, 0, 0], &mut FakeTransport::default());
        let pkt = Packet::new(PayloadType::TxtMsg, RouteType::Flood).with_payload(vec![0, 7, 0, 0]);
        let bytes = pkt.serialize();
        assert!(bridge.on_backhaul_message(&bytes).is_none());
        assert_eq!(bridge.stats().rx_banned, 1);
    }

    #[test]
    fn self_ban_clears_credentials_and_persists() {
        let (mut bridge, mut transport, mut prefs, mut persistence) = started_bridge();
        prefs.mqtt_server = "broker".into();
        prefs.mqtt_topic = "mesh/bridge".into();
        bridge.execute_self_ban(&mut transport, &mut prefs, &mut persistence, 0);
        assert!(prefs.mqtt_banned);
        assert!(prefs.mqtt_server.is_empty());
        assert!(!bridge.is_running());
        assert!(persistence.is_dirty(PersistKind::Prefs));
    }

    #[test]
    fn start_refused_while_banned_without_fresh_credentials() {
        let mut bridge = BridgeCore::new([1, 2, 3, 4], 16);
        let mut transport = FakeTransport { connect_should_succeed: true, ..Default::default() };
        let mut prefs = Prefs { mqtt_banned: true, ..Default::default() };
        let mut persistence = Persistence::new(1000);
        assert!(!bridge.start(&mut transport, &mut prefs, &mut persistence, 0));
    }

    #[test]
    fn start_while_banned_with_fresh_credentials_clears_ban() {
        let mut bridge = BridgeCore::new([1, 2, 3, 4], 16);
        let mut transport = FakeTransport { connect_should_succeed: true, ..Default::default() };
        let mut prefs = Prefs {
            mqtt_banned: true,
            mqtt_server: "broker".into(),
            mqtt_topic: "mesh/bridge".into(),
            mqtt_user: "u".into(),
            mqtt_pass: "p".into(),
            ..Default::default()
        };
        let mut persistence = Persistence::new(1000);
        assert!(bridge.start(&mut transport, &mut prefs, &mut persistence, 0));
        assert!(!prefs.mqtt_banned);
        assert!(persistence.is_dirty(PersistKind::Prefs));
    }

    #[test]
    fn unban_removes_prefix() {
        let mut bridge = BridgeCore::new([1, 2, 3, 4], 16);
        let mut transport = FakeTransport::default();
        bridge.ban([5, 5, 5, 5], &mut transport);
        assert!(bridge.unban([5, 5, 5, 5]));
        assert!(!bridge.ban_list.contains(&[5, 5, 5, 5]));
    }

    #[test]
    fn ban_always_publishes_even_when_list_is_full() {
        let mut bridge = BridgeCore::new([1, 2, 3, 4], 16);
        let mut transport = FakeTransport::default();
        for i in 0..BAN_LIST_SIZE as u8 {
            bridge.ban([i, 0, 0, 0], &mut transport);
        }
        transport.published.clear();
        bridge.ban([200, 0, 0, 0], &mut transport); // list full
        assert_eq!(transport.published.len(), 1);
    }
}
