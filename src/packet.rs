//! On-air packet representation and the payload-type/route-type enumerations
//! from the external interfaces section. Wire (de)serialisation is kept
//! deliberately simple (fixed header + raw payload bytes) since the actual
//! radio framing is owned by the external radio driver; this core only needs
//! a stable in-memory shape to dedupe, route, and reply to.

use crate::identity::{Identity, PUB_KEY_SIZE};

pub const MAX_PATH_LEN: usize = 64;
pub const MAX_PAYLOAD: usize = 184;

/// Payload type enumeration (upper byte of a packet; bit-exact per spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    Req = 0x00,
    Response = 0x01,
    TxtMsg = 0x02,
    Ack = 0x03,
    Advert = 0x04,
    GrpTxt = 0x05,
    GrpData = 0x06,
    AnonReq = 0x07,
    Path = 0x08,
    Trace = 0x09,
    Multipart = 0x0A,
    Control = 0x0B,
    RawCustom = 0x0F,
}

impl PayloadType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PayloadType::*;
        Some(match v {
            0x00 => Req,
            0x01 => Response,
            0x02 => TxtMsg,
            0x03 => Ack,
            0x04 => Advert,
            0x05 => GrpTxt,
            0x06 => GrpData,
            0x07 => AnonReq,
            0x08 => Path,
            0x09 => Trace,
            0x0A => Multipart,
            0x0B => Control,
            0x0F => RawCustom,
            _ => return None,
        })
    }
}

/// Route types encoded in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    Direct,
    Flood,
    TransportFlood,
    TransportDirect,
    Control,
}

/// Measured signal quality stamped on receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalQuality {
    pub snr: f32,
    pub rssi: f32,
}

impl SignalQuality {
    /// Per-packet quality metric in [0, 1], used by the rx-delay formula.
    /// Maps SNR linearly across a plausible LoRa window; clamps at the ends.
    pub fn score(&self) -> f32 {
        const SNR_FLOOR: f32 = -20.0;
        const SNR_CEIL: f32 = 10.0;
        ((self.snr - SNR_FLOOR) / (SNR_CEIL - SNR_FLOOR)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub payload_type: PayloadType,
    pub route_type: RouteType,
    pub path: Vec<u8>,
    pub transport_codes: Option<(u16, u16)>,
    pub payload: Vec<u8>,
    pub signal: SignalQuality,
    /// Cached region-deny verdict, set once by the router during classify,
    /// avoiding a second RegionMap lookup during the forward decision.
    pub deny_flood_cached: Option<bool>,
    /// Sender identity, carried in the mesh header alongside `path` (present
    /// even for ANON_REQ, which has no established ACL record yet).
    pub sender: Option<Identity>,
}

impl Packet {
    pub fn new(payload_type: PayloadType, route_type: RouteType) -> Self {
        Self {
            payload_type,
            route_type,
            path: Vec::new(),
            transport_codes: None,
            payload: Vec::new(),
            signal: SignalQuality::default(),
            deny_flood_cached: None,
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: Identity) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    pub fn with_path(mut self, path: Vec<u8>) -> Self {
        debug_assert!(path.len() <= MAX_PATH_LEN);
        self.path = path;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        self.payload = payload;
        self
    }

    /// Serialises the immutable fields used for both dedup fingerprints and
    /// bridge wire transfer:
    /// `[route_type][payload_type][transport_codes?][path][sender?][payload]`.
    /// `sender` is carried as a presence byte plus 32 key bytes so that a
    /// packet's identity survives a trip through the radio or the bridge
    /// backhaul (§4.7 needs it to resolve ACL records on arrival).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.path.len() + self.payload.len() + 1 + PUB_KEY_SIZE + 4);
        out.push(route_type_tag(self.route_type));
        out.push(self.payload_type as u8);
        if let Some((a, b)) = self.transport_codes {
            out.extend_from_slice(&a.to_le_bytes());
            out.extend_from_slice(&b.to_le_bytes());
        }
        out.push(self.path.len() as u8);
        out.extend_from_slice(&self.path);
        match self.sender {
            Some(sender) => {
                out.push(1);
                out.extend_from_slice(&sender.public_key);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        let route_type = route_type_from_tag(bytes[0])?;
        let payload_type = PayloadType::from_u8(bytes[1])?;
        let mut idx = 2;
        let transport_codes = if matches!(route_type, RouteType::TransportFlood | RouteType::TransportDirect) {
            if bytes.len() < idx + 4 {
                return None;
            }
            let a = u16::from_le_bytes([bytes[idx], bytes[idx + 1]]);
            let b = u16::from_le_bytes([bytes[idx + 2], bytes[idx + 3]]);
            idx += 4;
            Some((a, b))
        } else {
            None
        };
        if bytes.len() < idx + 1 {
            return None;
        }
        let path_len = bytes[idx] as usize;
        idx += 1;
        if path_len > MAX_PATH_LEN || bytes.len() < idx + path_len {
            return None;
        }
        let path = bytes[idx..idx + path_len].to_vec();
        idx += path_len;

        if bytes.len() < idx + 1 {
            return None;
        }
        let has_sender = bytes[idx] != 0;
        idx += 1;
        let sender = if has_sender {
            if bytes.len() < idx + PUB_KEY_SIZE {
                return None;
            }
            let mut pk = [0u8; PUB_KEY_SIZE];
            pk.copy_from_slice(&bytes[idx..idx + PUB_KEY_SIZE]);
            idx += PUB_KEY_SIZE;
            Some(Identity::new(pk))
        } else {
            None
        };

        let payload = bytes[idx..].to_vec();
        if payload.len() > MAX_PAYLOAD {
            return None;
        }
        Some(Packet {
            payload_type,
            route_type,
            path,
            transport_codes,
            payload,
            signal: SignalQuality::default(),
            deny_flood_cached: None,
            sender,
        })
    }

    /// Source hash byte used by bridge ban enforcement for TXT_MSG / REQ /
    /// RESPONSE / PATH packets (`payload[1]`, per §4.10).
    pub fn source_hash_byte(&self) -> Option<u8> {
        self.payload.get(1).copied()
    }

    /// First 4 bytes of the ADVERT payload, used by bridge ban enforcement.
    pub fn advert_prefix(&self) -> Option<[u8; 4]> {
        if self.payload_type != PayloadType::Advert || self.payload.len() < 4 {
            return None;
        }
        Some([self.payload[0], self.payload[1], self.payload[2], self.payload[3]])
    }
}

fn route_type_tag(r: RouteType) -> u8 {
    match r {
        RouteType::Direct => 0,
        RouteType::Flood => 1,
        RouteType::TransportFlood => 2,
        RouteType::TransportDirect => 3,
        RouteType::Control => 4,
    }
}

fn route_type_from_tag(tag: u8) -> Option<RouteType> {
    Some(match tag {
        0 => RouteType::Direct,
        1 => RouteType::Flood,
        2 => RouteType::TransportFlood,
        3 => RouteType::TransportDirect,
        4 => RouteType::Control,
        _ => return None,
    })
}

pub const _: () = assert!(PUB_KEY_SIZE == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_flood_packet() {
        let p = Packet::new(PayloadType::TxtMsg, RouteType::Flood)
            .with_path(vec![1, 2, 3])
            .with_payload(vec![9, 9, 9, 9]);
        let bytes = p.serialize();
        let back = Packet::deserialize(&bytes).unwrap();
        assert_eq!(back.payload_type, PayloadType::TxtMsg);
        assert_eq!(back.route_type, RouteType::Flood);
        assert_eq!(back.path, vec![1, 2, 3]);
        assert_eq!(back.payload, vec![9, 9, 9, 9]);
    }

    #[test]
    fn round_trips_transport_flood_codes() {
        let mut p = Packet::new(PayloadType::Advert, RouteType::TransportFlood);
        p.transport_codes = Some((42, 7));
        let bytes = p.serialize();
        let back = Packet::deserialize(&bytes).unwrap();
        assert_eq!(back.transport_codes, Some((42, 7)));
    }

    #[test]
    fn rejects_truncated_bytes() {
        assert!(Packet::deserialize(&[1]).is_none());
    }

    #[test]
    fn sender_survives_round_trip() {
        let sender = Identity::new([7u8; PUB_KEY_SIZE]);
        let p = Packet::new(PayloadType::AnonReq, RouteType::Flood).with_payload(vec![1, 2, 3]).with_sender(sender);
        let back = Packet::deserialize(&p.serialize()).unwrap();
        assert_eq!(back.sender, Some(sender));
    }

    #[test]
    fn absent_sender_round_trips_to_none() {
        let p = Packet::new(PayloadType::TxtMsg, RouteType::Direct).with_payload(vec![4]);
        let back = Packet::deserialize(&p.serialize()).unwrap();
        assert_eq!(back.sender, None);
    }
}
