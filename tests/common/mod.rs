//! Fixture captures and scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use capsweep::decode::{CaptureDecoder, DecodeError, DecodedCapture, Packet, PacketDecoder};
use capsweep::resources::{DiskSpace, ResourceProbe};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Ethernet / IPv4 / UDP frame with a 4-byte payload. `seq` varies the source port.
pub fn udp_frame(seq: u16) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    f.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    let total_len: u16 = 20 + 8 + 4;
    f.extend_from_slice(&[0x45, 0x00]);
    f.extend_from_slice(&total_len.to_be_bytes());
    f.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 0x40, 17, 0x00, 0x00]);
    f.extend_from_slice(&[10, 0, 0, 1]);
    f.extend_from_slice(&[10, 0, 0, 2]);
    f.extend_from_slice(&(1000 + seq).to_be_bytes());
    f.extend_from_slice(&53u16.to_be_bytes());
    f.extend_from_slice(&(8u16 + 4).to_be_bytes());
    f.extend_from_slice(&[0x00, 0x00]);
    f.extend_from_slice(b"ping");
    f
}

/// Ethernet frame carrying an IPv4 header cut off after 10 bytes.
pub fn truncated_ip_frame() -> Vec<u8> {
    let mut f = udp_frame(0);
    f.truncate(14 + 10);
    f
}

/// Classic little-endian microsecond pcap, Ethernet link type, one record per frame.
pub fn pcap_from_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    b.extend_from_slice(&2u16.to_le_bytes());
    b.extend_from_slice(&4u16.to_le_bytes());
    b.extend_from_slice(&0i32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&65535u32.to_le_bytes());
    b.extend_from_slice(&1u32.to_le_bytes());
    for (i, frame) in frames.iter().enumerate() {
        b.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        b.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        b.extend_from_slice(frame);
    }
    b
}

/// Classic pcap with `packets` UDP frames.
pub fn pcap_bytes(packets: usize) -> Vec<u8> {
    let frames: Vec<Vec<u8>> = (0..packets).map(|i| udp_frame(i as u16)).collect();
    pcap_from_frames(&frames)
}

fn ng_block(kind: u32, body: &[u8]) -> Vec<u8> {
    let padded = body.len().div_ceil(4) * 4;
    let total = (12 + padded) as u32;
    let mut b = Vec::new();
    b.extend_from_slice(&kind.to_le_bytes());
    b.extend_from_slice(&total.to_le_bytes());
    b.extend_from_slice(body);
    b.resize(8 + padded, 0);
    b.extend_from_slice(&total.to_le_bytes());
    b
}

/// pcapng with one Ethernet interface (microsecond resolution) and `packets` enhanced blocks.
pub fn pcapng_bytes(packets: usize) -> Vec<u8> {
    let mut shb = Vec::new();
    shb.extend_from_slice(&0x1a2b_3c4du32.to_le_bytes());
    shb.extend_from_slice(&1u16.to_le_bytes());
    shb.extend_from_slice(&0u16.to_le_bytes());
    shb.extend_from_slice(&(-1i64).to_le_bytes());
    let mut out = ng_block(0x0a0d_0d0a, &shb);

    let mut idb = Vec::new();
    idb.extend_from_slice(&1u16.to_le_bytes());
    idb.extend_from_slice(&0u16.to_le_bytes());
    idb.extend_from_slice(&65535u32.to_le_bytes());
    out.extend(ng_block(1, &idb));

    for i in 0..packets {
        let frame = udp_frame(i as u16);
        let ticks: u64 = 1_700_000_000_000_000 + i as u64;
        let mut epb = Vec::new();
        epb.extend_from_slice(&0u32.to_le_bytes());
        epb.extend_from_slice(&((ticks >> 32) as u32).to_le_bytes());
        epb.extend_from_slice(&(ticks as u32).to_le_bytes());
        epb.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        epb.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        epb.extend_from_slice(&frame);
        out.extend(ng_block(6, &epb));
    }
    out
}

pub fn write_file(root: &Path, rel: &str, bytes: &[u8]) -> PathBuf {
    let p = root.join(rel);
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&p, bytes).unwrap();
    p
}

pub fn write_pcap(root: &Path, rel: &str, packets: usize) -> PathBuf {
    write_file(root, rel, &pcap_bytes(packets))
}

pub fn write_pcapng(root: &Path, rel: &str, packets: usize) -> PathBuf {
    write_file(root, rel, &pcapng_bytes(packets))
}

/// Built-in decoder with per-file misbehavior keyed on the file name:
/// names containing `slow` sleep first, `panic` panics, `fail` returns an error,
/// `huge` repeats the first packet `huge_packets` times.
pub struct ScriptedDecoder {
    inner: CaptureDecoder,
    pub slow_delay: Duration,
    pub huge_packets: usize,
    pub calls: AtomicUsize,
    /// Decodes that returned, successfully or not.
    pub returned: AtomicUsize,
    pub released: AtomicUsize,
}

impl ScriptedDecoder {
    pub fn new(slow_delay: Duration) -> Self {
        Self {
            inner: CaptureDecoder::default(),
            slow_delay,
            huge_packets: 100_000,
            calls: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    fn decode_scripted(
        &self,
        name: &str,
        path: &Path,
        max_packets: Option<usize>,
    ) -> Result<DecodedCapture, DecodeError> {
        if name.contains("slow") {
            thread::sleep(self.slow_delay);
        }
        if name.contains("panic") {
            panic!("scripted decoder crash on {name}");
        }
        if name.contains("fail") {
            return Err(DecodeError::Collaborator(format!("scripted failure on {name}")));
        }
        let mut decoded = self.inner.decode(path, max_packets)?;
        if name.contains("huge")
            && let Some(first) = decoded.packets.first().cloned()
        {
            decoded.packets = (1..=self.huge_packets as u64)
                .map(|id| Packet { id, ..first.clone() })
                .collect();
            decoded.file_info.packet_count = decoded.packets.len();
        }
        Ok(decoded)
    }
}

impl PacketDecoder for ScriptedDecoder {
    fn decode(
        &self,
        path: &Path,
        max_packets: Option<usize>,
    ) -> Result<DecodedCapture, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let decoded = self.decode_scripted(&name, path, max_packets);
        self.returned.fetch_add(1, Ordering::SeqCst);
        decoded
    }

    fn release_buffers(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory readings replayed in order (last one repeats); fixed disk space.
pub struct ScriptedProbe {
    memory: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    space: Option<DiskSpace>,
    pub memory_reads: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(memory: &[f64], space: Option<DiskSpace>) -> Self {
        Self {
            memory: Mutex::new(memory.iter().copied().collect()),
            last: Mutex::new(memory.last().copied().unwrap_or(0.0)),
            space,
            memory_reads: AtomicUsize::new(0),
        }
    }

    /// Disk of `total_mb` with `free_mb` available.
    pub fn disk(total_mb: u64, free_mb: u64) -> DiskSpace {
        DiskSpace {
            total_bytes: total_mb * 1024 * 1024,
            available_bytes: free_mb * 1024 * 1024,
        }
    }
}

impl ResourceProbe for ScriptedProbe {
    fn memory_used_mb(&self) -> f64 {
        self.memory_reads.fetch_add(1, Ordering::SeqCst);
        match self.memory.lock().unwrap().pop_front() {
            Some(v) => v,
            None => *self.last.lock().unwrap(),
        }
    }

    fn disk_space(&self, _path: &Path) -> Option<DiskSpace> {
        self.space
    }
}
