//! Checkpoint document codec. The on-disk format is versioned JSON:
//!
//! ```json
//! {"v": 2, "<stream>": {"init": 0, "ranges": ["10-20", "30-40"]}}
//! ```
//!
//! The legacy single-stream layout (`{"v": 1, "init": 0, "ranges": [...]}`)
//! is accepted on read only and mapped to the stream id `"main"`; writes
//! always emit the current version. Anything else is corruption and must be
//! fatal at startup — resuming from a guessed position is worse than not
//! starting.

use crate::ranges::BlockRange;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub(crate) const FORMAT_VERSION: u64 = 2;
pub(crate) const LEGACY_STREAM_ID: &str = "main";

/// Corruption classes detected while loading a checkpoint document.
#[derive(Debug)]
pub enum CheckpointError {
    UnsupportedVersion { version: String },
    Malformed { detail: String },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::UnsupportedVersion { version } => {
                write!(f, "unsupported checkpoint format version {version}")
            }
            CheckpointError::Malformed { detail } => {
                write!(f, "malformed checkpoint document: {detail}")
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

/// One stream as it appears on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamRecord {
    pub init: u64,
    pub ranges: Vec<BlockRange>,
}

fn malformed(detail: impl Into<String>) -> CheckpointError {
    CheckpointError::Malformed {
        detail: detail.into(),
    }
}

pub(crate) fn decode(document: &str) -> Result<BTreeMap<String, StreamRecord>, CheckpointError> {
    let root: Value =
        serde_json::from_str(document).map_err(|err| malformed(format!("not JSON: {err}")))?;
    let Value::Object(map) = root else {
        return Err(malformed("top level is not an object"));
    };

    let version = match map.get("v") {
        Some(value) => value
            .as_u64()
            .ok_or_else(|| malformed("version field is not a number"))?,
        None => return Err(malformed("missing version field")),
    };

    match version {
        1 => {
            let record = decode_stream(&map, "legacy document")?;
            let mut streams = BTreeMap::new();
            streams.insert(LEGACY_STREAM_ID.to_owned(), record);
            Ok(streams)
        }
        2 => {
            let mut streams = BTreeMap::new();
            for (key, value) in &map {
                if key == "v" {
                    continue;
                }
                let Value::Object(entry) = value else {
                    return Err(malformed(format!("stream {key:?} is not an object")));
                };
                streams.insert(key.clone(), decode_stream(entry, key)?);
            }
            Ok(streams)
        }
        other => Err(CheckpointError::UnsupportedVersion {
            version: other.to_string(),
        }),
    }
}

fn decode_stream(
    entry: &Map<String, Value>,
    stream: &str,
) -> Result<StreamRecord, CheckpointError> {
    let init = entry
        .get("init")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(format!("stream {stream:?}: init is not a number")))?;

    let Some(Value::Array(raw_ranges)) = entry.get("ranges") else {
        return Err(malformed(format!("stream {stream:?}: ranges is not an array")));
    };

    let mut ranges = Vec::with_capacity(raw_ranges.len());
    for raw in raw_ranges {
        let Some(text) = raw.as_str() else {
            return Err(malformed(format!("stream {stream:?}: range is not a string")));
        };
        let range: BlockRange = text
            .parse()
            .map_err(|err| malformed(format!("stream {stream:?}: {err}")))?;
        ranges.push(range);
    }

    ensure_compacted(&ranges, stream)?;
    Ok(StreamRecord { init, ranges })
}

fn ensure_compacted(ranges: &[BlockRange], stream: &str) -> Result<(), CheckpointError> {
    for window in ranges.windows(2) {
        let gap_ok = window[0]
            .to()
            .checked_add(1)
            .map(|next| next < window[1].from())
            .unwrap_or(false);
        if !gap_ok {
            return Err(malformed(format!(
                "stream {stream:?}: ranges {} and {} are not sorted, disjoint, non-adjacent",
                window[0], window[1]
            )));
        }
    }
    Ok(())
}

pub(crate) fn encode(streams: &BTreeMap<String, StreamRecord>) -> String {
    let mut document = Map::new();
    document.insert("v".to_owned(), json!(FORMAT_VERSION));
    for (id, record) in streams {
        let ranges: Vec<String> = record.ranges.iter().map(BlockRange::to_string).collect();
        document.insert(id.clone(), json!({ "init": record.init, "ranges": ranges }));
    }
    Value::Object(document).to_string()
}
