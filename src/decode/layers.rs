//! Layer registry: protocol name → stateless field-extraction function.
//!
//! Dissection starts from the capture's link type and follows each handler's `next` hint until a
//! handler returns `None`, a protocol has no handler, or [`CaptureConsts::MAX_LAYERS`] is reached.
//! The built-in handlers parse headers with `etherparse` and only map its output to field names.

use etherparse::{
    EtherType, Ethernet2HeaderSlice, Icmpv4Slice, Icmpv6Slice, IpNumber, Ipv4HeaderSlice,
    Ipv6HeaderSlice, SingleVlanHeaderSlice, TcpHeaderSlice, UdpHeaderSlice,
};
use serde_json::{Value, json};
use std::collections::HashMap;

use super::{FieldMap, Layer};
use crate::utils::config::CaptureConsts;

/// Result of running one handler over the bytes at the current offset.
#[derive(Clone, Debug, Default)]
pub struct LayerDissection {
    pub fields: FieldMap,
    /// Bytes consumed by this layer's header.
    pub header_len: usize,
    /// Protocol of the enclosed payload, if known.
    pub next: Option<&'static str>,
    pub summary: Option<String>,
}

pub type LayerHandler = fn(&[u8]) -> Result<LayerDissection, String>;

/// Layers of one packet plus the first dissection problem, if any.
#[derive(Debug, Default)]
pub struct Dissected {
    pub layers: Vec<Layer>,
    pub warning: Option<String>,
}

// LINKTYPE_* values we know how to start from.
const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: [u32; 3] = [12, 14, 101];
const LINKTYPE_IPV4: u32 = 228;
const LINKTYPE_IPV6: u32 = 229;

#[derive(Clone)]
pub struct LayerRegistry {
    handlers: HashMap<String, LayerHandler>,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LayerRegistry {
    /// Registry with no handlers; every packet yields no layers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        r.register("ETH", dissect_ethernet);
        r.register("VLAN", dissect_vlan);
        r.register("IP", dissect_ipv4);
        r.register("IPV6", dissect_ipv6);
        r.register("TCP", dissect_tcp);
        r.register("UDP", dissect_udp);
        r.register("ICMP", dissect_icmp);
        r.register("ICMPV6", dissect_icmpv6);
        r.register("DATA", dissect_data);
        r
    }

    /// Add or replace the handler for `protocol` (case-insensitive). Returns the previous handler.
    pub fn register(&mut self, protocol: &str, handler: LayerHandler) -> Option<LayerHandler> {
        self.handlers.insert(protocol.to_ascii_uppercase(), handler)
    }

    pub fn unregister(&mut self, protocol: &str) -> Option<LayerHandler> {
        self.handlers.remove(&protocol.to_ascii_uppercase())
    }

    pub fn handler(&self, protocol: &str) -> Option<LayerHandler> {
        self.handlers.get(&protocol.to_ascii_uppercase()).copied()
    }

    /// Registered protocol names, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dissect one packet's bytes, outermost layer first.
    pub fn dissect(&self, link_type: u32, data: &[u8]) -> Dissected {
        let mut out = Dissected::default();
        let mut offset = 0_usize;
        let mut next = first_protocol(link_type, data);
        while let Some(proto) = next {
            if out.layers.len() >= CaptureConsts::MAX_LAYERS {
                break;
            }
            let Some(handler) = self.handler(proto) else {
                break;
            };
            let rest = &data[offset..];
            match handler(rest) {
                Ok(d) => {
                    offset += d.header_len.min(rest.len());
                    out.layers.push(Layer {
                        protocol: proto.to_string(),
                        fields: d.fields,
                        summary: d.summary,
                    });
                    next = d.next;
                }
                Err(reason) => {
                    out.warning = Some(format!("{proto}: {reason}"));
                    break;
                }
            }
        }
        out
    }
}

fn first_protocol(link_type: u32, data: &[u8]) -> Option<&'static str> {
    if data.is_empty() {
        return None;
    }
    match link_type {
        LINKTYPE_ETHERNET => Some("ETH"),
        LINKTYPE_IPV4 => Some("IP"),
        LINKTYPE_IPV6 => Some("IPV6"),
        lt if LINKTYPE_RAW.contains(&lt) => match data[0] >> 4 {
            4 => Some("IP"),
            6 => Some("IPV6"),
            _ => Some("DATA"),
        },
        _ => Some("DATA"),
    }
}

fn field_map<const N: usize>(pairs: [(&str, Value); N]) -> FieldMap {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn malformed(e: impl std::fmt::Display) -> String {
    format!("malformed header: {e}")
}

fn mac(b: &[u8]) -> String {
    b.iter()
        .map(|x| format!("{x:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn payload_next(rest: usize, proto: Option<&'static str>) -> Option<&'static str> {
    if rest == 0 { None } else { proto.or(Some("DATA")) }
}

fn ethertype_next(ethertype: EtherType) -> Option<&'static str> {
    match ethertype {
        EtherType::IPV4 => Some("IP"),
        EtherType::IPV6 => Some("IPV6"),
        EtherType::VLAN_TAGGED_FRAME | EtherType::PROVIDER_BRIDGING => Some("VLAN"),
        _ => None,
    }
}

fn ip_proto_next(proto: IpNumber) -> Option<&'static str> {
    match proto {
        IpNumber::ICMP => Some("ICMP"),
        IpNumber::TCP => Some("TCP"),
        IpNumber::UDP => Some("UDP"),
        IpNumber::IPV6_ICMP => Some("ICMPV6"),
        _ => None,
    }
}

fn dissect_ethernet(b: &[u8]) -> Result<LayerDissection, String> {
    let eth = Ethernet2HeaderSlice::from_slice(b).map_err(malformed)?;
    let (dst, src) = (mac(&eth.destination()), mac(&eth.source()));
    let ethertype = eth.ether_type();
    let header_len = eth.slice().len();
    Ok(LayerDissection {
        summary: Some(format!("{src} -> {dst}")),
        fields: field_map([
            ("dst", json!(dst)),
            ("src", json!(src)),
            ("type", json!(format!("0x{:04x}", ethertype.0))),
        ]),
        header_len,
        next: payload_next(b.len() - header_len, ethertype_next(ethertype)),
    })
}

fn dissect_vlan(b: &[u8]) -> Result<LayerDissection, String> {
    let vlan = SingleVlanHeaderSlice::from_slice(b).map_err(malformed)?;
    let raw = vlan.slice();
    let tci = u16::from_be_bytes([raw[0], raw[1]]);
    let id = tci & 0x0fff;
    let ethertype = vlan.ether_type();
    Ok(LayerDissection {
        summary: Some(format!("VLAN ID: {id}")),
        fields: field_map([
            ("id", json!(id)),
            ("priority", json!(tci >> 13)),
            ("type", json!(format!("0x{:04x}", ethertype.0))),
        ]),
        header_len: raw.len(),
        next: payload_next(b.len() - raw.len(), ethertype_next(ethertype)),
    })
}

fn dissect_ipv4(b: &[u8]) -> Result<LayerDissection, String> {
    let ip = Ipv4HeaderSlice::from_slice(b).map_err(malformed)?;
    let raw = ip.slice();
    let header_len = raw.len();
    let flags_frag = u16::from_be_bytes([raw[6], raw[7]]);
    let frag_offset = flags_frag & 0x1fff;
    let proto = ip.protocol();
    let (src, dst) = (ip.source_addr().to_string(), ip.destination_addr().to_string());
    // Only the first fragment carries the transport header.
    let inner = if frag_offset == 0 {
        ip_proto_next(proto)
    } else {
        None
    };
    Ok(LayerDissection {
        summary: Some(format!("{src} -> {dst}")),
        fields: field_map([
            ("version", json!(4)),
            ("hdr_len", json!(header_len)),
            ("dsfield", json!(format!("0x{:02x}", raw[1]))),
            ("len", json!(ip.total_len())),
            ("id", json!(format!("0x{:04x}", ip.identification()))),
            ("flags", json!(format!("0x{:x}", flags_frag >> 13))),
            ("frag_offset", json!(frag_offset)),
            ("ttl", json!(ip.ttl())),
            ("proto", json!(proto.0)),
            ("checksum", json!(format!("0x{:04x}", ip.header_checksum()))),
            ("src", json!(src)),
            ("dst", json!(dst)),
        ]),
        header_len,
        next: payload_next(b.len() - header_len, inner),
    })
}

fn dissect_ipv6(b: &[u8]) -> Result<LayerDissection, String> {
    let ip = Ipv6HeaderSlice::from_slice(b).map_err(malformed)?;
    let raw = ip.slice();
    let word = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let nxt = ip.next_header();
    let (src, dst) = (ip.source_addr().to_string(), ip.destination_addr().to_string());
    Ok(LayerDissection {
        summary: Some(format!("{src} -> {dst}")),
        fields: field_map([
            ("version", json!(6)),
            ("tclass", json!(format!("0x{:02x}", (word >> 20) & 0xff))),
            ("flow", json!(format!("0x{:05x}", word & 0x000f_ffff))),
            ("plen", json!(ip.payload_length())),
            ("nxt", json!(nxt.0)),
            ("hlim", json!(ip.hop_limit())),
            ("src", json!(src)),
            ("dst", json!(dst)),
        ]),
        header_len: raw.len(),
        next: payload_next(b.len() - raw.len(), ip_proto_next(nxt)),
    })
}

fn tcp_flag_names(flags: u16) -> String {
    const NAMES: [(u16, &str); 8] = [
        (0x80, "CWR"),
        (0x40, "ECE"),
        (0x20, "URG"),
        (0x10, "ACK"),
        (0x08, "PSH"),
        (0x04, "RST"),
        (0x02, "SYN"),
        (0x01, "FIN"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, n)| *n)
        .collect::<Vec<_>>()
        .join(",")
}

fn dissect_tcp(b: &[u8]) -> Result<LayerDissection, String> {
    let tcp = TcpHeaderSlice::from_slice(b).map_err(malformed)?;
    let hdr_len = tcp.slice().len();
    let (srcport, dstport) = (tcp.source_port(), tcp.destination_port());
    let flags = [
        (tcp.ns(), 0x100),
        (tcp.cwr(), 0x80),
        (tcp.ece(), 0x40),
        (tcp.urg(), 0x20),
        (tcp.ack(), 0x10),
        (tcp.psh(), 0x08),
        (tcp.rst(), 0x04),
        (tcp.syn(), 0x02),
        (tcp.fin(), 0x01),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .fold(0u16, |acc, (_, bit)| acc | bit);
    let names = tcp_flag_names(flags);
    Ok(LayerDissection {
        summary: Some(format!("Port {srcport} -> {dstport} [{names}]")),
        fields: field_map([
            ("srcport", json!(srcport)),
            ("dstport", json!(dstport)),
            ("seq", json!(tcp.sequence_number())),
            ("ack", json!(tcp.acknowledgment_number())),
            ("hdr_len", json!(hdr_len)),
            ("flags", json!(format!("0x{flags:03x}"))),
            ("flags_str", json!(names)),
            ("window", json!(tcp.window_size())),
            ("checksum", json!(format!("0x{:04x}", tcp.checksum()))),
            ("urgent_pointer", json!(tcp.urgent_pointer())),
            ("payload_len", json!(b.len() - hdr_len)),
        ]),
        header_len: hdr_len,
        next: None,
    })
}

fn dissect_udp(b: &[u8]) -> Result<LayerDissection, String> {
    let udp = UdpHeaderSlice::from_slice(b).map_err(malformed)?;
    let hdr_len = udp.slice().len();
    let (srcport, dstport) = (udp.source_port(), udp.destination_port());
    Ok(LayerDissection {
        summary: Some(format!("Port {srcport} -> {dstport}")),
        fields: field_map([
            ("srcport", json!(srcport)),
            ("dstport", json!(dstport)),
            ("length", json!(udp.length())),
            ("checksum", json!(format!("0x{:04x}", udp.checksum()))),
            ("payload_len", json!(b.len() - hdr_len)),
        ]),
        header_len: hdr_len,
        next: None,
    })
}

fn icmp_dissection(kind: u8, code: u8, checksum: u16, len: usize) -> LayerDissection {
    LayerDissection {
        summary: Some(format!("type {kind} code {code}")),
        fields: field_map([
            ("type", json!(kind)),
            ("code", json!(code)),
            ("checksum", json!(format!("0x{checksum:04x}"))),
        ]),
        header_len: len,
        next: None,
    }
}

fn dissect_icmp(b: &[u8]) -> Result<LayerDissection, String> {
    let icmp = Icmpv4Slice::from_slice(b).map_err(malformed)?;
    Ok(icmp_dissection(
        icmp.type_u8(),
        icmp.code_u8(),
        icmp.checksum(),
        b.len(),
    ))
}

fn dissect_icmpv6(b: &[u8]) -> Result<LayerDissection, String> {
    let icmp = Icmpv6Slice::from_slice(b).map_err(malformed)?;
    Ok(icmp_dissection(
        icmp.type_u8(),
        icmp.code_u8(),
        icmp.checksum(),
        b.len(),
    ))
}

fn dissect_data(b: &[u8]) -> Result<LayerDissection, String> {
    Ok(LayerDissection {
        fields: field_map([("length", json!(b.len()))]),
        header_len: b.len(),
        next: None,
        summary: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_frame() -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0xff; 6]); // dst
        f.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // src
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend_from_slice(&[
            0x45, 0, 0, 32, 0, 1, 0, 0, 64, 17, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2,
        ]);
        f.extend_from_slice(&[0x04, 0xd2, 0x00, 0x35, 0, 12, 0, 0]);
        f.extend_from_slice(b"ping");
        f
    }

    #[test]
    fn dissects_ethernet_ipv4_udp() {
        let reg = LayerRegistry::with_defaults();
        let d = reg.dissect(LINKTYPE_ETHERNET, &udp_frame());
        assert!(d.warning.is_none());
        let names: Vec<_> = d.layers.iter().map(|l| l.protocol.as_str()).collect();
        assert_eq!(names, vec!["ETH", "IP", "UDP"]);
        assert_eq!(d.layers[1].fields["src"], json!("10.0.0.1"));
        assert_eq!(d.layers[2].fields["dstport"], json!(53));
        assert_eq!(d.layers[2].fields["payload_len"], json!(4));
    }

    #[test]
    fn truncated_transport_is_a_warning() {
        let reg = LayerRegistry::with_defaults();
        let mut frame = udp_frame();
        frame.truncate(14 + 20 + 3);
        let d = reg.dissect(LINKTYPE_ETHERNET, &frame);
        assert_eq!(d.layers.len(), 2);
        assert!(d.warning.unwrap().starts_with("UDP: malformed header"));
    }

    #[test]
    fn unknown_ethertype_becomes_data() {
        let reg = LayerRegistry::with_defaults();
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x88, 0xcc, 1, 2, 3]);
        let d = reg.dissect(LINKTYPE_ETHERNET, &frame);
        assert_eq!(d.layers.last().unwrap().protocol, "DATA");
        assert_eq!(d.layers.last().unwrap().fields["length"], json!(3));
    }

    #[test]
    fn replaced_handler_is_used() {
        fn fake_udp(_: &[u8]) -> Result<LayerDissection, String> {
            Ok(LayerDissection {
                fields: field_map([("custom", json!(true))]),
                ..Default::default()
            })
        }
        let mut reg = LayerRegistry::with_defaults();
        assert!(reg.register("udp", fake_udp).is_some());
        let d = reg.dissect(LINKTYPE_ETHERNET, &udp_frame());
        assert_eq!(d.layers[2].fields["custom"], json!(true));
    }

    #[test]
    fn unregistered_protocol_stops_quietly() {
        let mut reg = LayerRegistry::with_defaults();
        reg.unregister("IP");
        let d = reg.dissect(LINKTYPE_ETHERNET, &udp_frame());
        assert_eq!(d.layers.len(), 1);
        assert!(d.warning.is_none());
    }

    #[test]
    fn raw_ip_link_type_picks_version() {
        let reg = LayerRegistry::with_defaults();
        let frame = udp_frame();
        let d = reg.dissect(101, &frame[14..]);
        assert_eq!(d.layers[0].protocol, "IP");
    }

    #[test]
    fn truncated_network_header_is_a_warning() {
        let reg = LayerRegistry::with_defaults();
        let mut frame = udp_frame();
        frame.truncate(14 + 10);
        let d = reg.dissect(LINKTYPE_ETHERNET, &frame);
        assert_eq!(d.layers.len(), 1);
        assert!(d.warning.unwrap().starts_with("IP: malformed header"));
    }

    #[test]
    fn arp_payload_is_kept_as_data() {
        let reg = LayerRegistry::with_defaults();
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x08, 0x06]);
        frame.extend_from_slice(&[0u8; 28]);
        let d = reg.dissect(LINKTYPE_ETHERNET, &frame);
        let names: Vec<_> = d.layers.iter().map(|l| l.protocol.as_str()).collect();
        assert_eq!(names, vec!["ETH", "DATA"]);
        assert_eq!(d.layers[1].fields["length"], json!(28));
    }

    #[test]
    fn tcp_syn_ack_fields() {
        let mut frame = udp_frame();
        frame.truncate(14 + 20);
        frame[14 + 9] = 6;
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&443u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&50000u16.to_be_bytes());
        tcp[4..8].copy_from_slice(&7u32.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = 0x12;
        tcp[14..16].copy_from_slice(&1024u16.to_be_bytes());
        frame.extend_from_slice(&tcp);
        let d = LayerRegistry::with_defaults().dissect(LINKTYPE_ETHERNET, &frame);
        assert!(d.warning.is_none());
        let t = &d.layers[2];
        assert_eq!(t.protocol, "TCP");
        assert_eq!(t.fields["seq"], json!(7));
        assert_eq!(t.fields["flags"], json!("0x012"));
        assert_eq!(t.fields["flags_str"], json!("ACK,SYN"));
        assert_eq!(t.fields["window"], json!(1024));
        assert_eq!(t.fields["payload_len"], json!(0));
    }

    #[test]
    fn tcp_flags_are_named() {
        assert_eq!(tcp_flag_names(0x012), "ACK,SYN");
        assert_eq!(tcp_flag_names(0), "");
    }
}
