//! Append-only trace streams (§6.4): one per batch for received notices,
//! one for sent updates, each committed atomically.
//!
//! Frame layout mirrors the teacher's own WAL framing
//! (`crate::pager::wal`): a fixed header followed by length-prefixed,
//! crc32-checked frames. Unlike the WAL, a trace stream never needs random
//! access or replay into pages — it exists purely as an audit log — so
//! frames are simply appended in order with no page/checksum-over-header
//! bookkeeping beyond the per-frame crc.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::clock::Timestamp;
use crate::error::{ProcessingError, Result};
use crate::model::{Payload, PointFlags, PointId, PointState, PointValue};

const TRACE_MAGIC: &[u8; 8] = b"DVTRACE\0";

fn payload_tag(payload: &Option<Payload>) -> u8 {
    match payload {
        None => 0,
        Some(Payload::Bool(_)) => 1,
        Some(Payload::Int(_)) => 2,
        Some(Payload::Float(_)) => 3,
        Some(Payload::Text(_)) => 4,
    }
}

fn state_tag(state: &Option<PointState>) -> u8 {
    match state {
        None => 0,
        Some(PointState::Good) => 1,
        Some(PointState::Uncertain) => 2,
        Some(PointState::Bad) => 3,
    }
}

fn decode_state(byte: u8) -> Option<PointState> {
    match byte {
        1 => Some(PointState::Good),
        2 => Some(PointState::Uncertain),
        3 => Some(PointState::Bad),
        _ => None,
    }
}

fn encode_value(value: &PointValue, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.point_id.raw().to_le_bytes());
    out.extend_from_slice(&value.timestamp.as_nanos().to_le_bytes());
    out.push(state_tag(&value.state));
    out.push(payload_tag(&value.payload));
    match &value.payload {
        None => {}
        Some(Payload::Bool(b)) => out.push(*b as u8),
        Some(Payload::Int(i)) => out.extend_from_slice(&i.to_le_bytes()),
        Some(Payload::Float(f)) => out.extend_from_slice(&f.to_le_bytes()),
        Some(Payload::Text(s)) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
    out.push(encode_flags(&value.flags));
}

fn encode_flags(flags: &PointFlags) -> u8 {
    (flags.deleted as u8)
        | ((flags.purged as u8) << 1)
        | ((flags.versioned as u8) << 2)
        | ((flags.synthesized as u8) << 3)
        | ((flags.interpolated as u8) << 4)
        | ((flags.extrapolated as u8) << 5)
        | ((flags.cacheable as u8) << 6)
        | ((flags.fetched as u8) << 7)
}

fn decode_flags(byte: u8) -> PointFlags {
    PointFlags {
        deleted: byte & 0x01 != 0,
        purged: byte & 0x02 != 0,
        versioned: byte & 0x04 != 0,
        synthesized: byte & 0x08 != 0,
        interpolated: byte & 0x10 != 0,
        extrapolated: byte & 0x20 != 0,
        cacheable: byte & 0x40 != 0,
        fetched: byte & 0x80 != 0,
        replaceable: false,
        recalc_trigger: false,
    }
}

fn decode_value(bytes: &[u8]) -> Option<(PointValue, usize)> {
    let mut pos = 0usize;
    let point_id = u128::from_le_bytes(bytes.get(pos..pos + 16)?.try_into().ok()?);
    pos += 16;
    let nanos = i64::from_le_bytes(bytes.get(pos..pos + 8)?.try_into().ok()?);
    pos += 8;
    let state = decode_state(*bytes.get(pos)?);
    pos += 1;
    let tag = *bytes.get(pos)?;
    pos += 1;
    let payload = match tag {
        0 => None,
        1 => {
            let b = *bytes.get(pos)? != 0;
            pos += 1;
            Some(Payload::Bool(b))
        }
        2 => {
            let v = i64::from_le_bytes(bytes.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
            Some(Payload::Int(v))
        }
        3 => {
            let v = f64::from_le_bytes(bytes.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
            Some(Payload::Float(v))
        }
        4 => {
            let len = u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?) as usize;
            pos += 4;
            let s = std::str::from_utf8(bytes.get(pos..pos + len)?).ok()?.to_string();
            pos += len;
            Some(Payload::Text(s))
        }
        _ => return None,
    };
    let flags_byte = *bytes.get(pos)?;
    pos += 1;
    let mut value = PointValue::new(PointId::new(point_id), Timestamp::from_nanos(nanos), Payload::Int(0));
    value.payload = payload;
    value.state = state;
    value.flags = decode_flags(flags_byte);
    Some((value, pos))
}

/// An append-only binary trace stream for one of the two per-batch
/// channels (`received` / `sent`). Values for the current, not-yet-committed
/// batch are held in memory; `commit` flushes them in one write, `rollback`
/// discards them, matching §6.4's "committed atomically" contract.
pub struct TraceWriter {
    path: PathBuf,
    file: Option<File>,
    pending: Vec<u8>,
}

impl TraceWriter {
    /// Open (creating if necessary) the trace file at `path`. When `enabled`
    /// is false, every operation becomes a no-op: no file is opened, so
    /// disabling traces costs nothing.
    pub fn open(path: PathBuf, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self {
                path,
                file: None,
                pending: Vec::new(),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(TRACE_MAGIC)?;
        }
        Ok(Self {
            path,
            file: Some(file),
            pending: Vec::new(),
        })
    }

    /// Append `values` to the in-memory pending buffer without touching the
    /// file; call `commit` to flush or `rollback` to discard.
    pub fn stage(&mut self, values: &[PointValue]) {
        if self.file.is_none() {
            return;
        }
        for value in values {
            let mut frame = Vec::new();
            encode_value(value, &mut frame);
            let mut hasher = Hasher::new();
            hasher.update(&frame);
            let crc = hasher.finalize();
            self.pending.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            self.pending.extend_from_slice(&frame);
            self.pending.extend_from_slice(&crc.to_le_bytes());
        }
    }

    /// Stage and immediately commit `values` as a single batch.
    pub fn append_and_commit(&mut self, values: &[PointValue]) -> Result<()> {
        self.stage(values);
        self.commit()
    }

    /// Flush the pending buffer to disk in one write and clear it.
    pub fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Some(file) = &mut self.file {
            file.write_all(&self.pending)?;
            file.sync_data()?;
        }
        self.pending.clear();
        Ok(())
    }

    /// Discard the pending buffer without writing it.
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Read every committed value back, in append order (used by tests and
    /// diagnostic tooling, not by the processing loop itself).
    pub fn read_all(path: &Path) -> Result<Vec<PointValue>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProcessingError::Io(e)),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < TRACE_MAGIC.len() {
            return Ok(Vec::new());
        }
        let mut pos = TRACE_MAGIC.len();
        let mut values = Vec::new();
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len + 4 > bytes.len() {
                break;
            }
            let frame = &bytes[pos..pos + len];
            pos += len;
            let crc_stored = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let mut hasher = Hasher::new();
            hasher.update(frame);
            if hasher.finalize() != crc_stored {
                break;
            }
            if let Some((value, _)) = decode_value(frame) {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// The path this trace stream writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn value(point: u128, stamp: i64, payload: f64) -> PointValue {
        PointValue::new(PointId::new(point), Timestamp::from_nanos(stamp), Payload::Float(payload))
            .with_flags(PointFlags::default().cacheable())
    }

    #[test]
    fn commit_round_trips_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("received.trace");
        let mut writer = TraceWriter::open(path.clone(), true).unwrap();
        writer.append_and_commit(&[value(1, 10, 2.0), value(2, 20, 3.0)]).unwrap();
        drop(writer);

        let values = TraceWriter::read_all(&path).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].point_id, PointId::new(1));
        assert_eq!(values[1].timestamp, Timestamp::from_nanos(20));
    }

    #[test]
    fn rollback_discards_pending_without_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("received.trace");
        let mut writer = TraceWriter::open(path.clone(), true).unwrap();
        writer.stage(&[value(1, 10, 2.0)]);
        writer.rollback();
        writer.commit().unwrap();
        drop(writer);

        let values = TraceWriter::read_all(&path).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn disabled_trace_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("received.trace");
        let mut writer = TraceWriter::open(path.clone(), false).unwrap();
        writer.append_and_commit(&[value(1, 10, 2.0)]).unwrap();
        assert!(!path.exists());
    }
}
