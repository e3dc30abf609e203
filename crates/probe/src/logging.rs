use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use prost::Message;

use crate::{
    check::{CheckReport, ComparisonSummary, SnapshotSummary},
    config::LoggingConfig,
    ProbeError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    pub report_path: Option<PathBuf>,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard_dir.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
            report_path: config.report_path.clone(),
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, ProbeError> {
        let events = match settings.tensorboard_dir.as_deref() {
            Some(dir) => Some(EventFile::create(dir, settings.tensorboard_flush_every_n)?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    /// Reports one gradient snapshot; `norms` holds the per-parameter L2 norms
    /// in snapshot order.
    pub fn log_snapshot(
        &mut self,
        step: usize,
        summary: &SnapshotSummary,
        norms: &[(String, f64)],
    ) {
        log::info!(
            "snapshot {} (batch {}): {} tensors, {} values, l2={:.6}",
            summary.label,
            summary.batch_index,
            summary.parameters,
            summary.flattened_len,
            summary.l2_norm
        );
        if self.settings.enable_stdout {
            println!(
                "snapshot step={} label={} batch={} params={} values={} grad_norm={:.6}",
                step,
                summary.label,
                summary.batch_index,
                summary.parameters,
                summary.flattened_len,
                summary.l2_norm
            );
        }

        self.scalar("grad_norm/total", step, summary.l2_norm);
        for (name, norm) in norms {
            self.scalar(&format!("grad_norm/{name}"), step, *norm);
        }
    }

    pub fn log_comparison(&mut self, step: usize, comparison: &ComparisonSummary) {
        if comparison.passed {
            log::info!("comparison {} passed", comparison.name);
        } else {
            log::warn!(
                "comparison {} failed (equal={}, different={}, only_left={}, only_right={})",
                comparison.name,
                comparison.equal.len(),
                comparison.different.len(),
                comparison.only_left.len(),
                comparison.only_right.len()
            );
        }
        if self.settings.enable_stdout {
            let cosine = comparison
                .cosine_similarity
                .map(|value| format!("{value:.6}"))
                .unwrap_or_else(|| "n/a".to_string());
            println!(
                "compare {} equal={} different={} cosine={} status={}",
                comparison.name,
                comparison.equal.len(),
                comparison.different.len(),
                cosine,
                if comparison.passed { "ok" } else { "FAILED" }
            );
        }

        let tag = format!("compare/{}", comparison.name);
        self.scalar(
            &format!("{tag}/equal_keys"),
            step,
            comparison.equal.len() as f64,
        );
        if let Some(cosine) = comparison.cosine_similarity {
            self.scalar(&format!("{tag}/cosine"), step, cosine);
        }
    }

    pub fn log_message(&self, message: &str) {
        log::info!("{message}");
        if self.settings.enable_stdout {
            println!("{message}");
        }
    }

    /// Writes the report as pretty JSON when a report path is configured.
    pub fn write_report(&self, report: &CheckReport) -> Result<Option<PathBuf>, ProbeError> {
        let Some(path) = self.settings.report_path.as_ref() else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(report)
            .map_err(|err| ProbeError::runtime(format!("failed to serialize report: {err}")))?;
        fs::write(path, json)?;
        log::info!("wrote report to {}", path.display());
        Ok(Some(path.clone()))
    }

    pub fn flush(&mut self) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.out.flush() {
                log::warn!("failed to flush tensorboard events: {err}");
            }
        }
    }

    /// Event-file failures never abort a check; they are logged and dropped.
    fn scalar(&mut self, tag: &str, step: usize, value: f64) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.append_scalar(tag, step, value) {
                log::warn!("dropping tensorboard scalar {tag}: {err}");
            }
        }
    }
}

/// Append-only TensorBoard event file. The buffered writer flushes on drop.
struct EventFile {
    out: BufWriter<File>,
    flush_every: usize,
    unflushed: usize,
}

impl EventFile {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, ProbeError> {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let path = dir.join(format!(
            "events.out.tfevents.{}.{host}",
            unix_time().trunc() as u64
        ));
        let file = fs::create_dir_all(dir)
            .and_then(|_| File::create(&path))
            .map_err(|err| {
                ProbeError::initialization(format!(
                    "cannot create event file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            out: BufWriter::new(file),
            flush_every: flush_every.max(1),
            unflushed: 0,
        })
    }

    fn append_scalar(&mut self, tag: &str, step: usize, value: f64) -> std::io::Result<()> {
        let event = Event {
            wall_time: unix_time(),
            step: step as i64,
            summary: Some(Summary {
                value: vec![SummaryValue {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.out.write_all(&frame_record(&event.encode_to_vec()))?;
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.out.flush()?;
            self.unflushed = 0;
        }
        Ok(())
    }
}

/// TFRecord layout: `u64` length, masked CRC of the length, payload, masked
/// CRC of the payload, all little-endian.
fn frame_record(payload: &[u8]) -> BytesMut {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
        .rotate_right(15)
        .wrapping_add(0xa282_ead8)
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

// Subset of tensorboard's event.proto and summary.proto.
#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}
