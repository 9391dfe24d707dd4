//! C7: ingress dispatcher. Per the REDESIGN FLAGS note on deep inheritance,
//! this is a plain struct plus a small capability bag of named callbacks
//! (`log_rx`, `log_tx`, `uniform_delay_ms`) supplied by value — no virtual
//! dispatch, no trait object per node.

use crate::packet::{Packet, PayloadType, RouteType};
use crate::region_map::{DENY_FLOOD, RegionMap, WILDCARD_ID};
use std::collections::HashMap;

pub struct RouterConfig {
    pub forwarding_enabled: bool,
    pub flood_max: u8,
    pub tx_delay_factor: f32,
    pub direct_tx_delay_factor: f32,
    /// <= 0 disables the rx-delay-by-quality adjustment.
    pub rx_delay_base: f32,
}

/// Named callbacks the application supplies, replacing the original's
/// virtual-override hooks. `uniform_delay_ms` takes an inclusive upper bound
/// (in ms) and returns a value in `[0, max]`; production wires this to the
/// crypto RNG, tests wire it to a deterministic stub.
pub struct RouterCallbacks {
    pub log_rx: Box<dyn Fn(&Packet) + Send>,
    pub log_tx: Box<dyn Fn(&Packet) + Send>,
    pub uniform_delay_ms: Box<dyn FnMut(u64) -> u64 + Send>,
}

impl RouterCallbacks {
    pub fn new(uniform_delay_ms: impl FnMut(u64) -> u64 + Send + 'static) -> Self {
        Self { log_rx: Box::new(|_| {}), log_tx: Box::new(|_| {}), uniform_delay_ms: Box::new(uniform_delay_ms) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Already processed (duplicate); accounting only.
    DuplicateDropped,
    NeighbourUpdate,
    AnonRequest,
    PeerRequest,
    Discovery,
    Retransmit,
    /// Permitted by no downstream handler and not forwardable.
    Ignored,
}

pub struct PacketRouter {
    pub config: RouterConfig,
    callbacks: RouterCallbacks,
}

impl PacketRouter {
    pub fn new(config: RouterConfig, callbacks: RouterCallbacks) -> Self {
        Self { config, callbacks }
    }

    /// Resolves the packet's region (Flood/TransportFlood only) and caches
    /// the deny-flood verdict plus whether the transport-code lookup failed.
    pub fn classify(&self, pkt: &mut Packet, region_map: &RegionMap, key_store: &HashMap<(u16, u16), u16>) {
        if !matches!(pkt.route_type, RouteType::Flood | RouteType::TransportFlood) {
            pkt.deny_flood_cached = None;
            return;
        }
        let region_id = match pkt.transport_codes {
            Some(codes) => key_store.get(&codes).copied(),
            None => Some(WILDCARD_ID),
        };
        let deny = match region_id {
            Some(id) => region_map.deny_check(id, DENY_FLOOD),
            // Transport codes present but unresolved: treated as deny so
            // allow_forward's explicit "unknown region" rule (below) fires.
            None => true,
        };
        pkt.deny_flood_cached = Some(deny);
    }

    /// §4.6 "Forward decision": false if forwarding is globally disabled,
    /// `path_len >= flood_max`, the resolved region denies flooding, or a
    /// TransportFlood packet's transport codes resolve to no known region.
    pub fn allow_forward(&self, pkt: &Packet, region_map: &RegionMap, key_store: &HashMap<(u16, u16), u16>) -> bool {
        if !self.config.forwarding_enabled {
            return false;
        }
        if pkt.path_len() as u8 >= self.config.flood_max {
            return false;
        }
        if pkt.route_type == RouteType::TransportFlood {
            match pkt.transport_codes {
                Some(codes) if key_store.get(&codes).is_none() => return false,
                _ => {}
            }
        }
        if matches!(pkt.route_type, RouteType::Flood | RouteType::TransportFlood) {
            if let Some(deny) = pkt.deny_flood_cached {
                return !deny;
            }
            // Not classified yet: resolve on the fly for safety.
            let region_id = match pkt.transport_codes {
                Some(codes) => key_store.get(&codes).copied(),
                None => Some(WILDCARD_ID),
            };
            return match region_id {
                Some(id) => !region_map.deny_check(id, DENY_FLOOD),
                None => false,
            };
        }
        true
    }

    /// Classifies by payload type for dispatch, per §4.6 step 4. `for_us`
    /// indicates the packet's destination (direct/path) resolves to this
    /// node, distinguishing a directed REQ/TXT_MSG/PATH/RESPONSE from one
    /// merely passing through.
    pub fn dispatch(&self, pkt: &Packet, for_us: bool) -> Destination {
        match pkt.payload_type {
            PayloadType::Advert => Destination::NeighbourUpdate,
            PayloadType::AnonReq => Destination::AnonRequest,
            PayloadType::Req | PayloadType::TxtMsg | PayloadType::Path | PayloadType::Response if for_us => Destination::PeerRequest,
            PayloadType::Control => Destination::Discovery,
            _ => Destination::Retransmit,
        }
    }

    /// Flood/Direct retransmit delay: `uniform(0, 5*T)` where
    /// `T = airtime_ms * delay_factor`.
    pub fn retransmit_delay_ms(&mut self, route_type: RouteType, airtime_ms: u64) -> u64 {
        let factor = if route_type == RouteType::Direct { self.config.direct_tx_delay_factor } else { self.config.tx_delay_factor };
        let t = (airtime_ms as f32 * factor).round() as u64;
        (self.callbacks.uniform_delay_ms)(t.saturating_mul(5))
    }

    /// Additional receive-side processing delay from the quality-dependent
    /// formula; `rx_delay_base <= 0` disables it entirely.
    pub fn rx_delay_extra_ms(&self, score: f32, airtime_ms: u64) -> u64 {
        if self.config.rx_delay_base <= 0.0 {
            return 0;
        }
        let factor = self.config.rx_delay_base.powf(0.85 - score) - 1.0;
        (factor.max(0.0) * airtime_ms as f32).round() as u64
    }

    pub fn log_rx(&self, pkt: &Packet) {
        (self.callbacks.log_rx)(pkt);
    }

    pub fn log_tx(&self, pkt: &Packet) {
        (self.callbacks.log_tx)(pkt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(flood_max: u8) -> PacketRouter {
        PacketRouter::new(
            RouterConfig { forwarding_enabled: true, flood_max, tx_delay_factor: 1.0, direct_tx_delay_factor: 1.0, rx_delay_base: 0.0 },
            RouterCallbacks::new(|max| max / 2),
        )
    }

    fn pkt_with_path(len: usize) -> Packet {
        Packet::new(PayloadType::TxtMsg, RouteType::Flood).with_path(vec![0u8; len])
    }

    #[test]
    fn path_len_equal_flood_max_not_forwarded() {
        let r = router(10);
        let pkt = pkt_with_path(10);
        let rm = RegionMap::new();
        let ks = HashMap::new();
        assert!(!r.allow_forward(&pkt, &rm, &ks));
    }

    #[test]
    fn path_len_one_below_flood_max_forwarded() {
        let r = router(10);
        let pkt = pkt_with_path(9);
        let rm = RegionMap::new();
        let ks = HashMap::new();
        assert!(r.allow_forward(&pkt, &rm, &ks));
    }

    #[test]
    fn deny_flood_region_blocks_transport_flood() {
        let r = router(64);
        let mut rm = RegionMap::new();
        let region = rm.put("denied", WILDCARD_ID, DENY_FLOOD, None).unwrap();
        let mut ks = HashMap::new();
        ks.insert((42, 0), region);

        let mut pkt = Packet::new(PayloadType::TxtMsg, RouteType::TransportFlood);
        pkt.transport_codes = Some((42, 0));
        r.classify(&mut pkt, &rm, &ks);
        assert!(!r.allow_forward(&pkt, &rm, &ks));
    }

    #[test]
    fn allowed_region_permits_transport_flood() {
        let r = router(64);
        let mut rm = RegionMap::new();
        let region = rm.put("allowed", WILDCARD_ID, 0, None).unwrap();
        let mut ks = HashMap::new();
        ks.insert((42, 0), region);

        let mut pkt = Packet::new(PayloadType::TxtMsg, RouteType::TransportFlood);
        pkt.transport_codes = Some((42, 0));
        r.classify(&mut pkt, &rm, &ks);
        assert!(r.allow_forward(&pkt, &rm, &ks));
    }

    #[test]
    fn unknown_transport_region_denies_forward() {
        let r = router(64);
        let rm = RegionMap::new();
        let ks = HashMap::new();
        let mut pkt = Packet::new(PayloadType::TxtMsg, RouteType::TransportFlood);
        pkt.transport_codes = Some((99, 99));
        r.classify(&mut pkt, &rm, &ks);
        assert!(!r.allow_forward(&pkt, &rm, &ks));
    }

    #[test]
    fn direct_packets_skip_region_classification() {
        let r = router(64);
        let rm = RegionMap::new();
        let ks = HashMap::new();
        let mut pkt = Packet::new(PayloadType::TxtMsg, RouteType::Direct);
        r.classify(&mut pkt, &rm, &ks);
        assert_eq!(pkt.deny_flood_cached, None);
        assert!(r.allow_forward(&pkt, &rm, &ks));
    }

    #[test]
    fn retransmit_delay_within_five_t_bound() {
        let mut r = router(64);
        let delay = r.retransmit_delay_ms(RouteType::Flood, 100);
        assert!(delay <= 500);
    }
}
