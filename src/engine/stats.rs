//! Per-file statistics over decoded packets: protocol mix, layer depth, sizes, time span.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::decode::Packet;

/// Width of one `size_histogram` bin, in bytes.
pub const SIZE_BIN_BYTES: u32 = 64;
/// Width of one `traffic` interval. Intervals are aligned to multiples of this on the epoch clock.
pub const TRAFFIC_INTERVAL_SECS: f64 = 60.0;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SizeStats {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimeRange {
    pub first: f64,
    pub last: f64,
    pub duration_seconds: f64,
}

/// Packets and bytes seen in one `[start, start + interval)` slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TrafficInterval {
    pub start: f64,
    pub packets: usize,
    pub bytes: u64,
    pub packets_per_second: f64,
    pub bytes_per_second: f64,
}

/// The `protocol_statistics` section of an output document.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CaptureStatistics {
    pub total_packets: usize,
    /// Packets containing each protocol.
    pub protocol_distribution: BTreeMap<String, usize>,
    /// Packets per layer count.
    pub layer_distribution: BTreeMap<usize, usize>,
    /// Packets per full protocol chain, e.g. `ETH/IP/TCP`.
    pub protocol_combinations: BTreeMap<String, usize>,
    pub unique_protocols: Vec<String>,
    pub protocol_count: usize,
    pub average_layers_per_packet: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<SizeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Packets per size bin, keyed by the bin's lower bound (`size / 64 * 64`).
    pub size_histogram: BTreeMap<u32, usize>,
    pub traffic_interval_seconds: f64,
    /// Per-interval traffic, ordered by start time. Empty slots are omitted.
    pub traffic: Vec<TrafficInterval>,
}

impl CaptureStatistics {
    pub fn from_packets(packets: &[Packet]) -> Self {
        let mut stats = CaptureStatistics {
            total_packets: packets.len(),
            traffic_interval_seconds: TRAFFIC_INTERVAL_SECS,
            ..Default::default()
        };
        if packets.is_empty() {
            return stats;
        }

        let mut total_layers = 0usize;
        let (mut min, mut max, mut total_bytes) = (u32::MAX, 0u32, 0u64);
        let (mut first, mut last) = (f64::INFINITY, f64::NEG_INFINITY);
        // slot index -> (packets, bytes)
        let mut slots: BTreeMap<i64, (usize, u64)> = BTreeMap::new();

        for packet in packets {
            let mut seen: Vec<&str> = Vec::with_capacity(packet.layers.len());
            for proto in packet.protocols() {
                if !seen.contains(&proto) {
                    seen.push(proto);
                    *stats
                        .protocol_distribution
                        .entry(proto.to_string())
                        .or_default() += 1;
                }
            }
            *stats
                .layer_distribution
                .entry(packet.layers.len())
                .or_default() += 1;
            let chain = packet.protocols().collect::<Vec<_>>().join("/");
            *stats.protocol_combinations.entry(chain).or_default() += 1;
            total_layers += packet.layers.len();

            min = min.min(packet.size);
            max = max.max(packet.size);
            total_bytes += packet.size as u64;
            first = first.min(packet.timestamp);
            last = last.max(packet.timestamp);

            *stats
                .size_histogram
                .entry(packet.size / SIZE_BIN_BYTES * SIZE_BIN_BYTES)
                .or_default() += 1;
            let slot = slots
                .entry((packet.timestamp / TRAFFIC_INTERVAL_SECS).floor() as i64)
                .or_default();
            slot.0 += 1;
            slot.1 += packet.size as u64;
        }

        stats.unique_protocols = stats.protocol_distribution.keys().cloned().collect();
        stats.protocol_count = stats.unique_protocols.len();
        stats.average_layers_per_packet = total_layers as f64 / packets.len() as f64;
        stats.size = Some(SizeStats {
            min,
            max,
            mean: total_bytes as f64 / packets.len() as f64,
            total_bytes,
        });
        stats.time_range = Some(TimeRange {
            first,
            last,
            duration_seconds: last - first,
        });
        stats.traffic = slots
            .into_iter()
            .map(|(slot, (packets, bytes))| TrafficInterval {
                start: slot as f64 * TRAFFIC_INTERVAL_SECS,
                packets,
                bytes,
                packets_per_second: packets as f64 / TRAFFIC_INTERVAL_SECS,
                bytes_per_second: bytes as f64 / TRAFFIC_INTERVAL_SECS,
            })
            .collect();
        stats
    }
}
