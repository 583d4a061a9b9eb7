//! One JSON document per decoded capture, written atomically (temp file then rename).
//!
//! Writing is split in two steps so the caller can decide between them whether the document
//! is still wanted: [`OutputWriter::stage`] fills the temp file, [`StagedDocument::commit`]
//! renames it into place.

use anyhow::{Context, Result, bail};
use log::debug;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::decode::{CaptureFormat, DecodedCapture, Packet};
use crate::engine::stats::CaptureStatistics;
use crate::utils::config::{FORMAT_VERSION, PackagePaths, TOOL_VERSION};
use crate::utils::tempfiles::{remove_stale_temp, rename_temp_to_final, temp_path_for};

#[derive(Serialize)]
struct Metadata<'a> {
    tool: &'a str,
    tool_version: &'a str,
    format_version: &'a str,
    generation_time: String,
    source_file: String,
}

#[derive(Serialize)]
struct FileInfoSection<'a> {
    input_file: String,
    file_name: &'a str,
    file_size: u64,
    packet_count: usize,
    format: CaptureFormat,
    link_type: u32,
    decode_time: f64,
}

#[derive(Serialize)]
struct ErrorsSection<'a> {
    error_count: usize,
    errors: &'a [String],
}

#[derive(Serialize)]
struct Document<'a> {
    metadata: Metadata<'a>,
    file_info: FileInfoSection<'a>,
    protocol_statistics: &'a CaptureStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<ErrorsSection<'a>>,
    packets: &'a [Packet],
}

/// Same document without `packets`; the packet array is appended record by record.
#[derive(Serialize)]
struct Header<'a> {
    metadata: Metadata<'a>,
    file_info: FileInfoSection<'a>,
    protocol_statistics: &'a CaptureStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<ErrorsSection<'a>>,
}

/// Serializes decode results. Above `streaming_threshold` packets the document is written compact
/// and one packet at a time instead of pretty-printed from a single value.
#[derive(Clone, Debug)]
pub struct OutputWriter {
    streaming_threshold: usize,
}

impl OutputWriter {
    pub fn new(streaming_threshold: usize) -> Self {
        Self {
            streaming_threshold,
        }
    }

    /// Write the document for `source` to `output_path`. Returns bytes written.
    pub fn write(
        &self,
        output_path: &Path,
        source: &Path,
        decoded: &DecodedCapture,
        stats: &CaptureStatistics,
        decode_time: Duration,
    ) -> Result<u64> {
        self.stage(output_path, source, decoded, stats, decode_time, &|| false)?
            .commit()
    }

    /// Write the document to the temp file next to `output_path`, without publishing it.
    ///
    /// `stop` is polled while packets are serialized; once it returns true the write is cut
    /// short and the temp file removed.
    pub fn stage(
        &self,
        output_path: &Path,
        source: &Path,
        decoded: &DecodedCapture,
        stats: &CaptureStatistics,
        decode_time: Duration,
        stop: &dyn Fn() -> bool,
    ) -> Result<StagedDocument> {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output directory {}", parent.display()))?;
        }
        let temp_path = temp_path_for(output_path);
        remove_stale_temp(&temp_path)?;

        let mut staged = StagedDocument {
            temp_path,
            output_path: output_path.to_path_buf(),
            bytes: 0,
            committed: false,
        };
        // On error `staged` drops here and takes the partial temp file with it.
        staged.bytes =
            self.write_temp(&staged.temp_path, source, decoded, stats, decode_time, stop)?;
        Ok(staged)
    }

    fn write_temp(
        &self,
        temp_path: &Path,
        source: &Path,
        decoded: &DecodedCapture,
        stats: &CaptureStatistics,
        decode_time: Duration,
        stop: &dyn Fn() -> bool,
    ) -> Result<u64> {
        let file = File::create(temp_path)
            .with_context(|| format!("create temp output {}", temp_path.display()))?;
        let mut out = BufWriter::new(file);

        let metadata = Metadata {
            tool: PackagePaths::get().pkg_name(),
            tool_version: TOOL_VERSION,
            format_version: FORMAT_VERSION,
            generation_time: chrono::Utc::now().to_rfc3339(),
            source_file: source.display().to_string(),
        };
        let file_info = FileInfoSection {
            input_file: source.display().to_string(),
            file_name: &decoded.file_info.name,
            file_size: decoded.file_info.size,
            packet_count: decoded.packets.len(),
            format: decoded.file_info.format,
            link_type: decoded.file_info.link_type,
            decode_time: decode_time.as_secs_f64(),
        };
        let errors = (!decoded.warnings.is_empty()).then(|| ErrorsSection {
            error_count: decoded.warnings.len(),
            errors: &decoded.warnings,
        });

        let body = if decoded.packets.len() > self.streaming_threshold {
            let header = Header {
                metadata,
                file_info,
                protocol_statistics: stats,
                errors,
            };
            write_streamed(&mut out, &header, &decoded.packets, stop)
        } else {
            let doc = Document {
                metadata,
                file_info,
                protocol_statistics: stats,
                errors,
                packets: &decoded.packets,
            };
            serde_json::to_writer_pretty(&mut out, &doc).context("serialize output document")
        };
        if stop() {
            bail!("output write stopped");
        }
        body.with_context(|| format!("write output document {}", temp_path.display()))?;

        let file = out
            .into_inner()
            .map_err(|e| e.into_error())
            .context("flush output document")?;
        file.sync_all().context("sync output document")?;
        Ok(file.metadata().map(|m| m.len()).unwrap_or(0))
    }
}

/// A fully written temp document waiting to be published. Dropping it without
/// [`commit`](Self::commit) deletes the temp file.
#[must_use]
pub struct StagedDocument {
    temp_path: PathBuf,
    output_path: PathBuf,
    bytes: u64,
    committed: bool,
}

impl StagedDocument {
    /// Rename the temp file into place. Returns bytes written.
    pub fn commit(mut self) -> Result<u64> {
        rename_temp_to_final(&self.temp_path, &self.output_path)?;
        self.committed = true;
        debug!("Wrote {} ({} bytes)", self.output_path.display(), self.bytes);
        Ok(self.bytes)
    }

    pub fn discard(self) {}
}

impl Drop for StagedDocument {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Packets serialized between two polls of the stop check.
const STOP_CHECK_EVERY: usize = 1024;

/// Serialize `header`, reopen its closing brace and append `"packets":[...]`.
fn write_streamed<W: Write>(
    out: &mut W,
    header: &Header<'_>,
    packets: &[Packet],
    stop: &dyn Fn() -> bool,
) -> Result<()> {
    let head = serde_json::to_vec(header)?;
    // `head` is a JSON object; drop its trailing `}` so packets become its last key.
    let open = head
        .strip_suffix(b"}")
        .context("serialized header is not an object")?;
    out.write_all(open)?;
    out.write_all(b",\"packets\":[")?;
    for (i, packet) in packets.iter().enumerate() {
        if i % STOP_CHECK_EVERY == 0 && stop() {
            bail!("output write stopped after {i} packets");
        }
        if i > 0 {
            out.write_all(b",")?;
        }
        serde_json::to_writer(&mut *out, packet)?;
    }
    out.write_all(b"]}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{FileInfo, Layer};

    fn capture(n: usize) -> DecodedCapture {
        let packets = (0..n)
            .map(|i| Packet {
                id: i as u64 + 1,
                timestamp: i as f64,
                size: 64,
                captured_size: 64,
                layers: vec![Layer {
                    protocol: "DATA".into(),
                    fields: Default::default(),
                    summary: None,
                }],
                summary: "DATA".into(),
            })
            .collect::<Vec<_>>();
        DecodedCapture {
            file_info: FileInfo {
                name: "a.pcap".into(),
                size: 1000,
                packet_count: packets.len(),
                format: CaptureFormat::Pcap,
                link_type: 147,
            },
            packets,
            warnings: vec!["packet #9: truncated".into()],
        }
    }

    fn write_and_parse(threshold: usize, n: usize) -> (serde_json::Value, String) {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("sub/a.pcap.json");
        let decoded = capture(n);
        let stats = CaptureStatistics::from_packets(&decoded.packets);
        OutputWriter::new(threshold)
            .write(
                &out,
                Path::new("/in/a.pcap"),
                &decoded,
                &stats,
                Duration::from_millis(5),
            )
            .unwrap();
        assert!(!temp_path_for(&out).exists());
        let text = fs::read_to_string(&out).unwrap();
        (serde_json::from_str(&text).unwrap(), text)
    }

    #[test]
    fn small_document_is_pretty() {
        let (doc, text) = write_and_parse(1000, 3);
        assert!(text.contains('\n'));
        assert_eq!(doc["file_info"]["packet_count"], 3);
        assert_eq!(doc["metadata"]["tool"], "capsweep");
        assert_eq!(doc["protocol_statistics"]["total_packets"], 3);
        assert_eq!(doc["errors"]["error_count"], 1);
        assert_eq!(doc["packets"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn large_document_is_streamed_compact() {
        let (doc, text) = write_and_parse(10, 25);
        assert!(!text.contains('\n'));
        assert_eq!(doc["packets"].as_array().unwrap().len(), 25);
        assert_eq!(doc["packets"][24]["id"], 25);
        assert_eq!(doc["file_info"]["format"], "pcap");
    }

    #[test]
    fn stopped_stage_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pcap.json");
        let decoded = capture(5000);
        let stats = CaptureStatistics::from_packets(&decoded.packets);
        let polls = std::cell::Cell::new(0);
        let stop = || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        };
        let staged = OutputWriter::new(10).stage(
            &out,
            Path::new("/in/a.pcap"),
            &decoded,
            &stats,
            Duration::ZERO,
            &stop,
        );
        assert!(staged.is_err());
        assert!(!temp_path_for(&out).exists());
        assert!(!out.exists());
    }

    #[test]
    fn discarded_stage_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.pcap.json");
        let decoded = capture(3);
        let stats = CaptureStatistics::from_packets(&decoded.packets);
        let staged = OutputWriter::new(1000)
            .stage(&out, Path::new("/in/a.pcap"), &decoded, &stats, Duration::ZERO, &|| false)
            .unwrap();
        assert!(temp_path_for(&out).exists());
        assert!(!out.exists());
        staged.discard();
        assert!(!temp_path_for(&out).exists());
        assert!(!out.exists());
    }
}
