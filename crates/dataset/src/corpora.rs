use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Trait for corpus types that can stream text documents.
pub trait TextCorpus {
    type Stream: Iterator<Item = io::Result<String>>;
    fn stream(&self) -> io::Result<Self::Stream>;
}

/// How a shard stores its documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardFormat {
    /// One document per non-empty line.
    PlainText,
    /// One JSON object per line; the document is a string field.
    JsonLines,
}

impl ShardFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("jsonl") | Some("ndjson") => ShardFormat::JsonLines,
            _ => ShardFormat::PlainText,
        }
    }
}

/// Streaming helper for sharded text corpora.
///
/// The iterator yields documents from each shard in order. Plain text shards
/// produce one document per non-empty line, `.jsonl` shards produce the
/// configured text field of each record.
#[derive(Clone, Debug)]
pub struct StreamingCorpus {
    shards: Vec<PathBuf>,
    text_field: String,
}

impl StreamingCorpus {
    pub fn new(shards: Vec<PathBuf>) -> io::Result<Self> {
        if shards.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "expected at least one shard for corpus",
            ));
        }

        log::debug!("streaming corpus over {} shard(s)", shards.len());

        Ok(Self {
            shards,
            text_field: "text".to_string(),
        })
    }

    /// Field read from JSON lines records. Defaults to `text`.
    pub fn with_text_field(mut self, field: impl Into<String>) -> Self {
        self.text_field = field.into();
        self
    }

    pub fn shard_paths(&self) -> &[PathBuf] {
        &self.shards
    }

    pub fn text_field(&self) -> &str {
        &self.text_field
    }
}

impl TextCorpus for StreamingCorpus {
    type Stream = CorpusStream;

    fn stream(&self) -> io::Result<Self::Stream> {
        Ok(CorpusStream {
            shards: self.shards.clone(),
            text_field: self.text_field.clone(),
            next_shard: 0,
            current: None,
        })
    }
}

struct OpenShard {
    path: PathBuf,
    format: ShardFormat,
    lines: io::Lines<BufReader<File>>,
    line_number: usize,
}

pub struct CorpusStream {
    shards: Vec<PathBuf>,
    text_field: String,
    next_shard: usize,
    current: Option<OpenShard>,
}

impl CorpusStream {
    fn advance_shard(&mut self) -> io::Result<bool> {
        let Some(path) = self.shards.get(self.next_shard).cloned() else {
            return Ok(false);
        };
        log::debug!(
            "streaming shard {} of {} -> {}",
            self.next_shard + 1,
            self.shards.len(),
            path.display()
        );
        let file = File::open(&path).map_err(|err| {
            io::Error::new(err.kind(), format!("failed to open shard {}: {err}", path.display()))
        })?;
        self.next_shard += 1;
        self.current = Some(OpenShard {
            format: ShardFormat::from_path(&path),
            path,
            lines: BufReader::new(file).lines(),
            line_number: 0,
        });
        Ok(true)
    }

    fn extract(&self, shard: &OpenShard, line: &str) -> io::Result<Option<String>> {
        match shard.format {
            ShardFormat::PlainText => Ok(Some(line.to_string())),
            ShardFormat::JsonLines => {
                let record: Value = serde_json::from_str(line).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "{} line {}: {err}",
                            shard.path.display(),
                            shard.line_number
                        ),
                    )
                })?;
                match record.get(&self.text_field) {
                    Some(Value::String(text)) => Ok(Some(text.clone())),
                    Some(Value::Null) | None => {
                        log::warn!(
                            "{} line {} has no `{}` field; skipping",
                            shard.path.display(),
                            shard.line_number,
                            self.text_field
                        );
                        Ok(None)
                    }
                    Some(other) => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "{} line {}: field `{}` is not a string ({other})",
                            shard.path.display(),
                            shard.line_number,
                            self.text_field
                        ),
                    )),
                }
            }
        }
    }
}

impl Iterator for CorpusStream {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(mut shard) = self.current.take() {
                match shard.lines.next() {
                    Some(Ok(line)) => {
                        shard.line_number += 1;
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            self.current = Some(shard);
                            continue;
                        }
                        let extracted = self.extract(&shard, trimmed);
                        self.current = Some(shard);
                        match extracted {
                            Ok(Some(text)) if !text.trim().is_empty() => return Some(Ok(text)),
                            Ok(_) => continue,
                            Err(err) => return Some(Err(err)),
                        }
                    }
                    Some(Err(err)) => {
                        self.current = Some(shard);
                        return Some(Err(err));
                    }
                    None => continue,
                }
            }

            match self.advance_shard() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Corpus backed by documents held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCorpus {
    documents: Vec<String>,
}

impl InMemoryCorpus {
    pub fn new<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            documents: documents.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl TextCorpus for InMemoryCorpus {
    type Stream = std::vec::IntoIter<io::Result<String>>;

    fn stream(&self) -> io::Result<Self::Stream> {
        Ok(self
            .documents
            .iter()
            .filter(|doc| !doc.trim().is_empty())
            .cloned()
            .map(Ok)
            .collect::<Vec<_>>()
            .into_iter())
    }
}
