//! Capture file reading on top of `pcap-parser`: classic libpcap (either byte order, micro or
//! nanosecond) and pcapng.
//!
//! Small files are read into a pooled buffer; large ones are memory-mapped. A truncated or
//! malformed block ends the file with a warning instead of failing it.

use log::debug;
use memmap2::Mmap;
use pcap_parser::{Block, PcapBlockOwned, PcapError, create_reader};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::layers::LayerRegistry;
use super::{DecodeError, DecodedCapture, FileInfo, Packet, PacketDecoder};
use crate::utils::config::CaptureConsts;

/// On-disk container format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Pcap,
    PcapNanos,
    PcapNg,
}

/// pcapng interface: link type and timestamp units per second.
#[derive(Clone, Copy, Debug)]
struct Interface {
    link_type: u32,
    units_per_sec: u64,
}

/// One packet record before layer dissection.
struct RawRecord<'a> {
    timestamp: f64,
    orig_len: u32,
    link_type: u32,
    data: &'a [u8],
}

/// Decoded packets from an in-memory capture.
pub struct DecodedBytes {
    pub packets: Vec<Packet>,
    pub format: CaptureFormat,
    pub link_type: u32,
    pub warnings: Vec<String>,
}

/// Per-file reading state carried across blocks.
struct Reading<'r> {
    registry: &'r LayerRegistry,
    format: CaptureFormat,
    link_type: Option<u32>,
    nanos: bool,
    interfaces: Vec<Interface>,
    packets: Vec<Packet>,
    warnings: Vec<String>,
}

impl Reading<'_> {
    fn next_id(&self) -> u64 {
        self.packets.len() as u64 + 1
    }

    fn on_block(&mut self, block: PcapBlockOwned<'_>) {
        match block {
            PcapBlockOwned::LegacyHeader(header) => {
                self.nanos = header.is_nanosecond_precision();
                self.format = if self.nanos {
                    CaptureFormat::PcapNanos
                } else {
                    CaptureFormat::Pcap
                };
                self.link_type = Some(header.network.0 as u32);
            }
            PcapBlockOwned::Legacy(b) => {
                let per_sec = if self.nanos { 1e9 } else { 1e6 };
                let cap_len = (b.caplen as usize).min(b.data.len());
                self.push(RawRecord {
                    timestamp: b.ts_sec as f64 + b.ts_usec as f64 / per_sec,
                    orig_len: b.origlen,
                    link_type: self.link_type.unwrap_or_default(),
                    data: &b.data[..cap_len],
                });
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.format = CaptureFormat::PcapNg;
                // Interface ids are scoped to their section.
                self.interfaces.clear();
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                let link_type = idb.linktype.0 as u32;
                self.link_type.get_or_insert(link_type);
                self.interfaces.push(Interface {
                    link_type,
                    units_per_sec: idb.ts_resolution().unwrap_or(1_000_000).max(1),
                });
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let id = self.next_id();
                let Some(iface) = self.interfaces.get(epb.if_id as usize).copied() else {
                    self.warnings
                        .push(format!("packet #{id}: unknown interface {}", epb.if_id));
                    return;
                };
                let ticks = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                let cap_len = (epb.caplen as usize).min(epb.data.len());
                self.push(RawRecord {
                    timestamp: ticks as f64 / iface.units_per_sec as f64,
                    orig_len: epb.origlen,
                    link_type: iface.link_type,
                    data: &epb.data[..cap_len],
                });
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let id = self.next_id();
                let Some(iface) = self.interfaces.first().copied() else {
                    self.warnings
                        .push(format!("packet #{id}: simple packet before any interface"));
                    return;
                };
                let cap_len = (spb.origlen as usize).min(spb.data.len());
                self.push(RawRecord {
                    timestamp: 0.0,
                    orig_len: spb.origlen,
                    link_type: iface.link_type,
                    data: &spb.data[..cap_len],
                });
            }
            _ => {}
        }
    }

    fn push(&mut self, record: RawRecord<'_>) {
        let id = self.next_id();
        let dissected = self.registry.dissect(record.link_type, record.data);
        if let Some(w) = dissected.warning {
            self.warnings.push(format!("packet #{id}: {w}"));
        }
        let summary = dissected
            .layers
            .iter()
            .rev()
            .find_map(|l| l.summary.clone())
            .unwrap_or_else(|| {
                dissected
                    .layers
                    .iter()
                    .map(|l| l.protocol.as_str())
                    .collect::<Vec<_>>()
                    .join("/")
            });
        self.packets.push(Packet {
            id,
            timestamp: record.timestamp,
            size: record.orig_len,
            captured_size: record.data.len() as u32,
            layers: dissected.layers,
            summary,
        });
    }
}

/// Decode a whole capture held in memory. Stops after `max_packets` when set.
pub fn decode_capture_bytes(
    data: &[u8],
    max_packets: Option<usize>,
    registry: &LayerRegistry,
) -> Result<DecodedBytes, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::invalid("empty file"));
    }
    let mut reader = create_reader(CaptureConsts::READER_CAPACITY, data)
        .map_err(|e| DecodeError::invalid(format!("unrecognized capture header: {e}")))?;
    let cap = max_packets.unwrap_or(usize::MAX);
    let mut reading = Reading {
        registry,
        format: CaptureFormat::Pcap,
        link_type: None,
        nanos: false,
        interfaces: Vec::new(),
        packets: Vec::new(),
        warnings: Vec::new(),
    };
    // Set after a refill; a second `Incomplete` in a row means the input ran out mid-block.
    let mut refilled = false;
    loop {
        if reading.packets.len() >= cap {
            debug!("Reached packet cap: {}", cap);
            break;
        }
        match reader.next() {
            Ok((offset, block)) => {
                refilled = false;
                reading.on_block(block);
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) if !refilled => {
                refilled = true;
                if let Err(e) = reader.refill() {
                    let id = reading.next_id();
                    reading.warnings.push(format!("packet #{id}: read error: {e}"));
                    break;
                }
            }
            Err(PcapError::Incomplete(_)) | Err(PcapError::UnexpectedEof) => {
                let id = reading.next_id();
                reading
                    .warnings
                    .push(format!("packet #{id}: truncated record at end of file"));
                break;
            }
            Err(e) => {
                let id = reading.next_id();
                reading.warnings.push(format!("packet #{id}: malformed block: {e}"));
                break;
            }
        }
    }
    Ok(DecodedBytes {
        packets: reading.packets,
        format: reading.format,
        link_type: reading.link_type.unwrap_or_default(),
        warnings: reading.warnings,
    })
}

/// File contents: mapped for large captures, owned otherwise.
enum CaptureBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for CaptureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            CaptureBytes::Mapped(m) => m,
            CaptureBytes::Owned(v) => v,
        }
    }
}

/// Built-in decoder for pcap/pcapng files.
///
/// Read buffers of small files are kept for reuse by later files and dropped by
/// [`PacketDecoder::release_buffers`].
#[derive(Default)]
pub struct CaptureDecoder {
    registry: LayerRegistry,
    spare: Mutex<Vec<Vec<u8>>>,
}

impl Clone for CaptureDecoder {
    fn clone(&self) -> Self {
        Self::new(self.registry.clone())
    }
}

impl CaptureDecoder {
    pub fn new(registry: LayerRegistry) -> Self {
        Self {
            registry,
            spare: Mutex::default(),
        }
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// Buffers currently held for reuse.
    pub fn pooled_buffers(&self) -> usize {
        self.spare().len()
    }

    fn spare(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.spare.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, path: &Path, size: u64) -> std::io::Result<CaptureBytes> {
        let mut file = File::open(path)?;
        if size > CaptureConsts::MMAP_THRESHOLD {
            // The file is opened read-only and not modified while mapped.
            let mmap = unsafe { Mmap::map(&file)? };
            return Ok(CaptureBytes::Mapped(mmap));
        }
        let mut buf = self.spare().pop().unwrap_or_default();
        buf.clear();
        file.read_to_end(&mut buf)?;
        Ok(CaptureBytes::Owned(buf))
    }

    fn recycle(&self, bytes: CaptureBytes) {
        let CaptureBytes::Owned(buf) = bytes else {
            return;
        };
        if buf.capacity() > CaptureConsts::POOLED_BUFFER_MAX_BYTES {
            return;
        }
        let mut spare = self.spare();
        if spare.len() < CaptureConsts::POOLED_BUFFERS {
            spare.push(buf);
        }
    }
}

impl PacketDecoder for CaptureDecoder {
    fn decode(
        &self,
        path: &Path,
        max_packets: Option<usize>,
    ) -> Result<DecodedCapture, DecodeError> {
        let meta = std::fs::metadata(path).map_err(|e| DecodeError::io(path, e))?;
        if !meta.is_file() {
            return Err(DecodeError::io(
                path,
                std::io::Error::other("not a regular file"),
            ));
        }
        let bytes = self
            .load(path, meta.len())
            .map_err(|e| DecodeError::io(path, e))?;
        let decoded = decode_capture_bytes(&bytes, max_packets, &self.registry);
        self.recycle(bytes);
        let decoded = decoded?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(DecodedCapture {
            file_info: FileInfo {
                name,
                size: meta.len(),
                packet_count: decoded.packets.len(),
                format: decoded.format,
                link_type: decoded.link_type,
            },
            packets: decoded.packets,
            warnings: decoded.warnings,
        })
    }

    fn release_buffers(&self) {
        let mut spare = self.spare();
        if !spare.is_empty() {
            debug!("Releasing {} pooled read buffers", spare.len());
        }
        spare.clear();
        spare.shrink_to_fit();
    }
}
