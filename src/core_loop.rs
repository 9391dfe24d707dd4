//! C13: the `Core` aggregate and its single-threaded cooperative scheduler.
//! Per the REDESIGN FLAGS note on static global singletons, `Core` is an
//! explicit struct built at startup and threaded through every call; there is
//! no module-level mutable state anywhere in this crate.

use crate::acl::ClientStore;
use crate::advert_scheduler::{AdvertKind, AdvertScheduler};
use crate::bridge::BridgeCore;
use crate::clock::Clock;
use crate::identity::Identity;
use crate::neighbour_table::NeighbourTable;
use crate::packet::{Packet, PayloadType, RouteType};
use crate::persistence::{PersistKind, Persistence, atomic_write};
use crate::radio::{RadioDriver, TxRequest};
use crate::radio_param_controller::RadioParamController;
use crate::region_map::RegionMap;
use crate::request_handler::{ANON_DISC_CLOCK, ANON_DISC_OWNER_INFO, ANON_DISC_REGIONS, CliBackend, ReplyRouting, RequestHandler, determine_reply_routing};
use crate::router::{Destination, PacketRouter};
use crate::seen_table::SeenTable;
use crate::stats::RepeaterStats;
use crate::transport::BridgeTransport;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

/// Bounds how many not-yet-processed inbound frames the ingress pump can
/// queue before the oldest is dropped, so a burst from the radio cannot grow
/// memory unboundedly on a device with a few hundred kilobytes of RAM.
const RX_QUEUE_CAPACITY: usize = 32;

pub struct PersistPaths {
    pub prefs: PathBuf,
    pub acl: PathBuf,
    pub region: PathBuf,
}

/// Everything the node owns, passed by reference to every operation instead
/// of living behind global statics.
pub struct Core {
    pub clock: Clock,
    pub prefs: crate::config::Prefs,
    pub acl: ClientStore,
    pub neighbours: Option<NeighbourTable>,
    pub region_map: RegionMap,
    pub key_store: HashMap<(u16, u16), u16>,
    pub seen: SeenTable,
    pub router: PacketRouter,
    pub request_handler: RequestHandler,
    pub advert_scheduler: AdvertScheduler,
    pub radio_param_controller: RadioParamController,
    pub bridge: BridgeCore,
    pub persistence: Persistence,
    pub stats: RepeaterStats,
    pub self_identity: Identity,

    radio: Box<dyn RadioDriver>,
    transport: Box<dyn BridgeTransport>,
    cli: Box<dyn CliBackend>,
    paths: PersistPaths,

    send_queue: VecDeque<TxRequest>,
    rx_queue: VecDeque<(Packet, bool)>,
    start_ms: u64,
}

impl Core {
    /// Loads persisted ACL/region state if present, defaulting forward-
    /// compatibly on a missing or unreadable file (§6 "Persisted state").
    #[allow(clippy::too_many_arguments)]
    pub fn bootstrap(
        paths: PersistPaths,
        self_identity: Identity,
        node_type_bit: u8,
        radio: Box<dyn RadioDriver>,
        transport: Box<dyn BridgeTransport>,
        cli: Box<dyn CliBackend>,
        now_ms: u64,
    ) -> Self {
        let prefs = crate::config::Prefs::load(&paths.prefs).unwrap_or_default();
        let acl = std::fs::read(&paths.acl).ok().and_then(|b| ClientStore::from_bytes(&b, 64)).unwrap_or_else(|| ClientStore::new(64));
        let region_map = std::fs::read(&paths.region).ok().and_then(|b| RegionMap::from_bytes(&b)).unwrap_or_default();

        let request_handler = RequestHandler::new(
            prefs.node_name.clone(),
            prefs.owner_info.clone(),
            prefs.firmware_level,
            &prefs.admin_password,
            &prefs.guest_password,
            self_identity,
            node_type_bit,
        );
        let router = PacketRouter::new(
            crate::router::RouterConfig {
                forwarding_enabled: prefs.repeater_enabled,
                flood_max: prefs.flood_max,
                tx_delay_factor: prefs.tx_delay_factor,
                direct_tx_delay_factor: prefs.direct_tx_delay_factor,
                rx_delay_base: prefs.rx_delay_base,
            },
            crate::router::RouterCallbacks::new(|max| if max == 0 { 0 } else { crate::clock::random_u32() as u64 % (max + 1) }),
        );
        let radio_param_controller = RadioParamController::new(radio.current_params());
        let bridge = BridgeCore::new([self_identity.public_key[0], self_identity.public_key[1], self_identity.public_key[2], self_identity.public_key[3]], 256);

        Self {
            advert_scheduler: AdvertScheduler::new(prefs.advert_local_interval, prefs.advert_flood_interval, now_ms),
            clock: Clock::new(),
            acl,
            neighbours: Some(NeighbourTable::new(64)),
            region_map,
            key_store: HashMap::new(),
            seen: SeenTable::new(256),
            router,
            request_handler,
            radio_param_controller,
            bridge,
            persistence: Persistence::new(3_000),
            stats: RepeaterStats::default(),
            self_identity,
            radio,
            transport,
            cli,
            paths,
            send_queue: VecDeque::new(),
            rx_queue: VecDeque::new(),
            start_ms: now_ms,
            prefs,
        }
    }

    /// Pushed to by the radio driver's receive path. `for_us` is resolved by
    /// the mesh addressing layer outside this core (§1 Non-goals: "routing
    /// topology computation" is out of scope) and simply passed through.
    pub fn ingest_radio_frame(&mut self, raw: &[u8], snr: f32, rssi: f32, for_us: bool) {
        let Some(mut pkt) = Packet::deserialize(raw) else {
            self.stats.n_recv_errors += 1;
            return;
        };
        pkt.signal = crate::packet::SignalQuality { snr, rssi };
        if self.rx_queue.len() >= RX_QUEUE_CAPACITY {
            self.rx_queue.pop_front();
        }
        self.rx_queue.push_back((pkt, for_us));
    }

    /// One cooperative scheduler iteration (§4.12). No step blocks.
    pub fn tick(&mut self, now_ms: u64) {
        let now_wall = self.clock.wall_now();

        self.drive_bridge(now_ms);
        self.drain_one_send(now_ms);
        self.pump_mesh_ingress(now_ms, now_wall);
        self.check_timers(now_ms, now_wall);

        self.stats.total_up_time_secs = (now_ms.saturating_sub(self.start_ms) / 1000) as u32;
    }

    /// True when it is safe to let the platform sleep until the next timer.
    pub fn low_power_ok(&self) -> bool {
        self.send_queue.is_empty() && !self.bridge.is_running()
    }

    fn drive_bridge(&mut self, now_ms: u64) {
        self.bridge.poll_reconnect(self.transport.as_mut(), &mut self.prefs, &mut self.persistence, now_ms);

        if let Some(bytes) = self.transport.try_recv() {
            if let Some(pkt) = self.bridge.on_backhaul_message(&bytes) {
                if self.rx_queue.len() >= RX_QUEUE_CAPACITY {
                    self.rx_queue.pop_front();
                }
                self.rx_queue.push_back((pkt, false));
            }
        }

        if self.bridge.take_deferred_self_ban() {
            self.bridge.execute_self_ban(self.transport.as_mut(), &mut self.prefs, &mut self.persistence, now_ms);
        }
    }

    fn drain_one_send(&mut self, now_ms: u64) {
        if let Some(req) = self.send_queue.front() {
            if req.release_at_ms <= now_ms {
                let req = self.send_queue.pop_front().unwrap();
                self.radio.enqueue_tx(req);
            }
        }
    }

    fn pump_mesh_ingress(&mut self, now_ms: u64, now_wall: u32) {
        if let Some((pkt, for_us)) = self.rx_queue.pop_front() {
            self.process_inbound(pkt, for_us, now_ms, now_wall);
        }
    }

    fn check_timers(&mut self, now_ms: u64, now_wall: u32) {
        if let Some(kind) = self.advert_scheduler.poll(now_ms) {
            self.queue_advert(kind, now_ms);
        }
        if let Some(params) = self.radio_param_controller.poll(now_ms) {
            self.radio.set_params(params);
        }
        self.flush_persistence(now_ms);
        let _ = now_wall;
    }

    fn flush_persistence(&mut self, now_ms: u64) {
        for kind in self.persistence.due(now_ms) {
            let result = match kind {
                PersistKind::Acl => atomic_write(&self.paths.acl, &self.acl.to_bytes()),
                PersistKind::Region => atomic_write(&self.paths.region, &self.region_map.to_bytes()),
                PersistKind::Prefs => self.prefs.to_toml_string().and_then(|s| atomic_write(&self.paths.prefs, s.as_bytes())),
            };
            match result {
                Ok(()) => self.persistence.clear(kind),
                Err(e) => log::error!("persistence flush failed for {kind:?}: {e}"),
            }
        }
    }

    fn queue_advert(&mut self, kind: AdvertKind, now_ms: u64) {
        let route_type = match kind {
            AdvertKind::Local => RouteType::Direct,
            AdvertKind::Flood => RouteType::Flood,
        };
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&self.clock.wall_now().to_le_bytes());
        let pkt = Packet::new(PayloadType::Advert, route_type).with_payload(payload).with_sender(self.self_identity);
        if route_type == RouteType::Flood {
            self.stats.n_sent_flood += 1;
        } else {
            self.stats.n_sent_direct += 1;
        }
        self.queue_packet_for_send(pkt, now_ms);
    }

    /// The full ingress pipeline: dedupe, classify, forward decision, then
    /// dispatch by payload type (§4.6).
    fn process_inbound(&mut self, mut pkt: Packet, for_us: bool, now_ms: u64, now_wall: u32) {
        self.router.log_rx(&pkt);
        self.stats.n_pkts_recv += 1;

        if self.seen.check_and_mark(&pkt) {
            match pkt.route_type {
                RouteType::Direct | RouteType::TransportDirect => self.stats.n_direct_dups += 1,
                _ => self.stats.n_flood_dups += 1,
            }
            return;
        }

        self.router.classify(&mut pkt, &self.region_map, &self.key_store);
        let forward_allowed = self.router.allow_forward(&pkt, &self.region_map, &self.key_store);

        match self.router.dispatch(&pkt, for_us) {
            Destination::DuplicateDropped => {}
            Destination::NeighbourUpdate => self.handle_advert(&pkt, now_ms, now_wall),
            Destination::AnonRequest => self.handle_anon_request(&pkt, now_ms, now_wall),
            Destination::PeerRequest => self.handle_peer_request(&pkt, now_ms, now_wall),
            Destination::Discovery => self.handle_discovery(&pkt, now_ms, now_wall),
            Destination::Retransmit | Destination::Ignored => {
                if forward_allowed {
                    self.retransmit(pkt, now_ms);
                }
            }
        }
    }

    fn retransmit(&mut self, pkt: Packet, now_ms: u64) {
        let airtime_ms = self.radio.est_airtime(pkt.path_len() + pkt.payload.len() + 2).as_millis();
        let delay = self.router.retransmit_delay_ms(pkt.route_type, airtime_ms);
        match pkt.route_type {
            RouteType::Direct | RouteType::TransportDirect => self.stats.n_sent_direct += 1,
            _ => self.stats.n_sent_flood += 1,
        }
        self.queue_packet_for_send(pkt, now_ms + delay);
    }

    fn handle_advert(&mut self, pkt: &Packet, now_ms: u64, now_wall: u32) {
        let Some(sender) = pkt.sender else { return };
        let advert_ts = pkt.payload.get(0..4).map(|b| u32::from_le_bytes(b.try_into().unwrap())).unwrap_or(now_wall);
        if let Some(table) = &mut self.neighbours {
            table.put(sender, advert_ts, pkt.signal.snr, now_wall, now_ms);
        }
    }

    fn handle_anon_request(&mut self, pkt: &Packet, now_ms: u64, now_wall: u32) {
        if pkt.payload.len() < 5 {
            return;
        }
        let ts = u32::from_le_bytes(pkt.payload[0..4].try_into().unwrap());
        let discriminator = pkt.payload[4];
        let arrived_via_flood = pkt.route_type == RouteType::Flood;

        let reply = if discriminator == 0 || discriminator >= 0x20 {
            let Some(sender) = pkt.sender else { return };
            let password = &pkt.payload[5..];
            self.request_handler.handle_login(ts, password, sender, arrived_via_flood, &mut self.acl, &self.clock)
        } else {
            match discriminator {
                ANON_DISC_REGIONS => self.request_handler.handle_regions_request(ts, &self.region_map, &self.clock),
                ANON_DISC_OWNER_INFO => self.request_handler.handle_owner_info_request(ts, &self.clock),
                ANON_DISC_CLOCK => {
                    self.request_handler.handle_clock_request(ts, !self.prefs.mqtt_server.is_empty(), self.prefs.mqtt_banned, &self.clock)
                }
                _ => return,
            }
        };

        // Only an admin login is worth the write: guest logins and the
        // regions/owner-info/clock anon queries stay off the ACL hot path.
        if reply.as_ref().is_some_and(|r| r.len() == 13 && r[6] == 1) {
            self.persistence.mark_dirty(PersistKind::Acl, now_ms);
        }
        if let Some(reply_bytes) = reply {
            let routing = determine_reply_routing(arrived_via_flood, None, None);
            self.queue_reply(PayloadType::Response, reply_bytes, routing, pkt, now_ms);
        }
        let _ = now_wall;
    }

    fn handle_peer_request(&mut self, pkt: &Packet, now_ms: u64, _now_wall: u32) {
        let Some(sender) = pkt.sender else { return };
        let arrived_via_flood = pkt.route_type == RouteType::Flood;
        let cached_out_path = self.acl.get_by_pubkey(&sender).and_then(|r| r.out_path.clone());

        match pkt.payload_type {
            PayloadType::Req => {
                let telemetry_full: [u8; 0] = [];
                let telemetry_guest: [u8; 0] = [];
                if let Some(reply) = self.request_handler.handle_auth_request(
                    &sender,
                    &pkt.payload,
                    &mut self.acl,
                    self.neighbours.as_ref(),
                    &self.stats,
                    &telemetry_full,
                    &telemetry_guest,
                    &self.clock,
                ) {
                    let routing = determine_reply_routing(arrived_via_flood, None, cached_out_path.as_deref());
                    self.queue_reply(PayloadType::Response, reply, routing, pkt, now_ms);
                }
            }
            PayloadType::TxtMsg => {
                let sender_pubkey = sender.public_key;
                if let Some(outcome) = self.request_handler.handle_admin_txt(&sender, &sender_pubkey, &pkt.payload, &mut self.acl, self.cli.as_mut(), &self.clock) {
                    if !outcome.reply.is_empty() {
                        let routing = determine_reply_routing(arrived_via_flood, None, cached_out_path.as_deref());
                        self.queue_reply(PayloadType::TxtMsg, outcome.reply, routing, pkt, now_ms);
                    }
                    if let Some(ack) = outcome.ack {
                        let routing = determine_reply_routing(arrived_via_flood, None, cached_out_path.as_deref());
                        self.queue_reply(PayloadType::Ack, ack.to_vec(), routing, pkt, now_ms);
                    }
                }
            }
            PayloadType::Path => {
                self.request_handler.handle_path(&sender, &pkt.path, &mut self.acl, &self.clock);
            }
            PayloadType::Response => {
                // This node only serves requests; an unsolicited RESPONSE
                // addressed to it has no further processing.
            }
            _ => {}
        }
    }

    fn handle_discovery(&mut self, pkt: &Packet, now_ms: u64, now_wall: u32) {
        let forwarding_enabled = self.router.config.forwarding_enabled;
        let node_role_bits = self.request_handler.node_type_bit;
        let inbound_snr_q2 = (pkt.signal.snr * 4.0).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8;
        if let Some(reply) = self.request_handler.handle_discovery(&pkt.payload, inbound_snr_q2, forwarding_enabled, node_role_bits, now_wall) {
            let reply_pkt = Packet::new(PayloadType::Control, RouteType::Flood).with_payload(reply).with_sender(self.self_identity);
            // Several repeaters can hear the same broadcast and answer at
            // once; widen the usual retransmit scatter (x4) so they don't
            // collide on air.
            let airtime_ms = self.radio.est_airtime(reply_pkt.path_len() + reply_pkt.payload.len() + 2).as_millis();
            let delay = self.router.retransmit_delay_ms(RouteType::Flood, airtime_ms).saturating_mul(4);
            self.queue_packet_for_send(reply_pkt, now_ms + delay);
        }
    }

    fn queue_reply(&mut self, payload_type: PayloadType, payload: Vec<u8>, routing: ReplyRouting, original: &Packet, now_ms: u64) {
        let (route_type, path) = match routing {
            ReplyRouting::FloodWithPathPrime => (RouteType::Flood, original.path.clone()),
            ReplyRouting::Flood => (RouteType::Flood, Vec::new()),
            ReplyRouting::Direct(path) => (RouteType::Direct, path),
        };
        let reply_pkt = Packet::new(payload_type, route_type).with_path(path).with_payload(payload).with_sender(self.self_identity);
        let release_at = now_ms + self.prefs.server_response_delay_ms;
        self.queue_packet_for_send(reply_pkt, release_at);
    }

    fn queue_packet_for_send(&mut self, pkt: Packet, release_at_ms: u64) {
        self.router.log_tx(&pkt);
        self.bridge.on_local_packet(&pkt, self.transport.as_mut());
        self.stats.n_pkts_sent += 1;
        self.send_queue.push_back(TxRequest { payload: pkt.serialize(), release_at_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioParams;
    use embassy_time::Duration;

    struct FakeRadio {
        params: RadioParams,
        sent: Vec<TxRequest>,
    }

    impl RadioDriver for FakeRadio {
        fn est_airtime(&self, byte_len: usize) -> Duration {
            Duration::from_millis(byte_len as u64)
        }
        fn enqueue_tx(&mut self, req: TxRequest) {
            self.sent.push(req);
        }
        fn current_params(&self) -> RadioParams {
            self.params
        }
        fn set_params(&mut self, params: RadioParams) {
            self.params = params;
        }
        fn set_airtime_factor(&mut self, _factor: f32) {}
    }

    #[derive(Default)]
    struct FakeTransport;
    impl BridgeTransport for FakeTransport {
        fn publish(&mut self, _bytes: &[u8]) {}
        fn try_recv(&mut self) -> Option<Vec<u8>> {
            None
        }
        fn is_connected(&self) -> bool {
            false
        }
        fn disconnect(&mut self) {}
        fn connect(&mut self) -> bool {
            false
        }
    }

    struct EchoCli;
    impl CliBackend for EchoCli {
        fn handle(&mut self, payload: &[u8]) -> Vec<u8> {
            payload.to_vec()
        }
    }

    fn id(b: u8) -> Identity {
        let mut pk = [0u8; 32];
        pk[0] = b;
        Identity::new(pk)
    }

    fn test_core(dir: &std::path::Path) -> Core {
        let radio = Box::new(FakeRadio { params: RadioParams { freq_mhz: 868.0, bandwidth_khz: 125.0, spreading_factor: 9, coding_rate: 5 }, sent: Vec::new() });
        let paths = PersistPaths { prefs: dir.join("prefs.toml"), acl: dir.join("acl.bin"), region: dir.join("region.bin") };
        Core::bootstrap(paths, id(0), 0x01, radio, Box::new(FakeTransport), Box::new(EchoCli), 0)
    }

    #[test]
    fn login_then_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = crate::config::Prefs::default();
        prefs.admin_password = "password".into();
        std::fs::write(dir.path().join("prefs.toml"), prefs.to_toml_string().unwrap()).unwrap();
        let mut core = test_core(dir.path());

        let mut login_payload = Vec::new();
        login_payload.extend_from_slice(&1000u32.to_le_bytes());
        login_payload.push(0); // login discriminator
        login_payload.extend_from_slice(b"password\0");
        let login_pkt = Packet::new(PayloadType::AnonReq, RouteType::Flood).with_payload(login_payload).with_sender(id(1));
        core.ingest_radio_frame(&login_pkt.serialize(), 2.0, -80.0, true);
        core.tick(10);
        assert!(core.acl.get_by_pubkey(&id(1)).is_some());
        assert_eq!(core.stats.n_pkts_sent, 1);
    }

    #[test]
    fn low_power_ok_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        assert!(core.low_power_ok());
    }

    #[test]
    fn advert_timer_queues_a_send() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = test_core(dir.path());
        core.advert_scheduler = AdvertScheduler::new(1, 0, 0); // 2-minute local interval
        core.tick(120_000);
        assert!(!core.low_power_ok());
    }
}
