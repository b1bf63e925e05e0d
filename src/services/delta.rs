//! Block-matching binary delta between two archive versions.
//!
//! The original is cut into fixed-size blocks indexed by a rolling weak
//! checksum. The altered file is scanned byte by byte; a window whose
//! checksum hits the index and whose bytes match exactly becomes a copy,
//! extended forward as long as the bytes keep matching. Everything else is
//! emitted as literal inserts.
//!
//! Encoding: `AVDELTA1`, u64 LE target length, then a sequence of
//! `0x01 offset:u64 len:u64` (copy from original) and
//! `0x02 len:u32 bytes` (insert literal) ops.

use std::collections::HashMap;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"AVDELTA1";
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;
const MIN_BLOCK_SIZE: usize = 16;
const MAX_INSERT: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("delta does not start with the expected header")]
    BadMagic,
    #[error("delta is truncated")]
    Truncated,
    #[error("unknown delta op {0:#04x}")]
    UnknownOp(u8),
    #[error("copy of {len} bytes at {offset} exceeds original length {original_len}")]
    CopyOutOfRange {
        offset: u64,
        len: u64,
        original_len: usize,
    },
    #[error("delta produced {actual} bytes, header declares {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Copy { offset: usize, len: usize },
    Insert { start: usize, end: usize },
}

/// Adler-style rolling checksum over a fixed window.
#[derive(Clone, Copy)]
struct Rolling {
    a: u32,
    b: u32,
    window: u32,
}

impl Rolling {
    fn new(block: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        let n = block.len() as u32;
        for (i, &byte) in block.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((n - i as u32).wrapping_mul(byte as u32));
        }
        Self { a, b, window: n }
    }

    fn roll(&mut self, out: u8, incoming: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(incoming as u32);
        self.b = self
            .b
            .wrapping_sub(self.window.wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }

    fn digest(&self) -> u32 {
        ((self.b & 0xffff) << 16) | (self.a & 0xffff)
    }
}

/// Compute a delta that rebuilds `altered` from `original`.
pub fn diff(original: &[u8], altered: &[u8], block_size: usize) -> Vec<u8> {
    let block = block_size.max(MIN_BLOCK_SIZE);

    let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
    for offset in (0..original.len()).step_by(block) {
        if offset + block > original.len() {
            break;
        }
        let digest = Rolling::new(&original[offset..offset + block]).digest();
        index.entry(digest).or_default().push(offset);
    }

    let mut ops: Vec<Op> = Vec::new();
    let mut literal_start = 0usize;
    let mut i = 0usize;
    let mut rolling = (altered.len() >= block).then(|| Rolling::new(&altered[..block]));

    while let Some(window) = rolling {
        if i + block > altered.len() {
            break;
        }
        let found = index.get(&window.digest()).and_then(|candidates| {
            candidates
                .iter()
                .copied()
                .find(|&off| original[off..off + block] == altered[i..i + block])
        });

        if let Some(offset) = found {
            let mut len = block;
            while offset + len < original.len()
                && i + len < altered.len()
                && original[offset + len] == altered[i + len]
            {
                len += 1;
            }
            push_insert(&mut ops, literal_start, i);
            push_copy(&mut ops, offset, len);
            i += len;
            literal_start = i;
            rolling = (i + block <= altered.len()).then(|| Rolling::new(&altered[i..i + block]));
            continue;
        }

        if i + block < altered.len() {
            let mut next = window;
            next.roll(altered[i], altered[i + block]);
            rolling = Some(next);
        } else {
            rolling = None;
        }
        i += 1;
    }
    push_insert(&mut ops, literal_start, altered.len());

    encode(&ops, altered)
}

fn push_insert(ops: &mut Vec<Op>, start: usize, end: usize) {
    if start < end {
        ops.push(Op::Insert { start, end });
    }
}

fn push_copy(ops: &mut Vec<Op>, offset: usize, len: usize) {
    if let Some(Op::Copy {
        offset: prev_offset,
        len: prev_len,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_len == offset {
            *prev_len += len;
            return;
        }
    }
    ops.push(Op::Copy { offset, len });
}

fn encode(ops: &[Op], altered: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + ops.len() * 17);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(altered.len() as u64).to_le_bytes());
    for op in ops {
        match *op {
            Op::Copy { offset, len } => {
                out.push(OP_COPY);
                out.extend_from_slice(&(offset as u64).to_le_bytes());
                out.extend_from_slice(&(len as u64).to_le_bytes());
            }
            Op::Insert { start, end } => {
                for piece in altered[start..end].chunks(MAX_INSERT) {
                    out.push(OP_INSERT);
                    out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
                    out.extend_from_slice(piece);
                }
            }
        }
    }
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DeltaError> {
        let end = self.pos.checked_add(n).ok_or(DeltaError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(DeltaError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u64(&mut self) -> Result<u64, DeltaError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| DeltaError::Truncated)?))
    }

    fn u32(&mut self) -> Result<u32, DeltaError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| DeltaError::Truncated)?))
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Rebuild the altered bytes from `original` and an encoded delta.
pub fn apply(original: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut reader = Reader { buf: delta, pos: 0 };
    if reader.take(MAGIC.len()).map_err(|_| DeltaError::BadMagic)? != MAGIC {
        return Err(DeltaError::BadMagic);
    }
    let expected = reader.u64()?;
    let mut out = Vec::with_capacity(expected.min(1 << 30) as usize);

    while !reader.done() {
        match reader.take(1)?[0] {
            OP_COPY => {
                let offset = reader.u64()?;
                let len = reader.u64()?;
                let range = offset
                    .checked_add(len)
                    .filter(|end| *end <= original.len() as u64)
                    .map(|end| offset as usize..end as usize)
                    .ok_or(DeltaError::CopyOutOfRange {
                        offset,
                        len,
                        original_len: original.len(),
                    })?;
                out.extend_from_slice(&original[range]);
            }
            OP_INSERT => {
                let len = reader.u32()? as usize;
                out.extend_from_slice(reader.take(len)?);
            }
            other => return Err(DeltaError::UnknownOp(other)),
        }
    }

    if out.len() as u64 != expected {
        return Err(DeltaError::LengthMismatch {
            expected,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn identical_inputs_collapse_to_one_copy() {
        let data = noise(1, 64 * 1024);
        let delta = diff(&data, &data, 1024);
        // header + a single copy op
        assert_eq!(delta.len(), MAGIC.len() + 8 + 17);
        assert_eq!(apply(&data, &delta).unwrap(), data);
    }

    #[test]
    fn shifted_content_is_found_at_any_offset() {
        let original = noise(2, 32 * 1024);
        let mut altered = b"new header bytes!".to_vec();
        altered.extend_from_slice(&original[..20_000]);
        altered.extend_from_slice(&noise(3, 500));
        altered.extend_from_slice(&original[20_000..]);

        let delta = diff(&original, &altered, 512);
        assert!(delta.len() < 2 * 1024, "delta was {} bytes", delta.len());
        assert_eq!(apply(&original, &delta).unwrap(), altered);
    }

    #[test]
    fn unrelated_inputs_become_literals() {
        let original = noise(4, 4096);
        let altered = noise(5, 3000);
        let delta = diff(&original, &altered, 256);
        assert_eq!(apply(&original, &delta).unwrap(), altered);
    }

    #[test]
    fn empty_sides_are_handled() {
        let data = noise(6, 100);
        assert_eq!(apply(&[], &diff(&[], &data, 64)).unwrap(), data);
        assert!(apply(&data, &diff(&data, &[], 64)).unwrap().is_empty());
    }

    #[test]
    fn malformed_deltas_are_rejected() {
        let original = noise(7, 1000);
        let delta = diff(&original, &original, 64);

        assert_eq!(apply(&original, b"NOTDELTA"), Err(DeltaError::BadMagic));
        assert_eq!(
            apply(&original, &delta[..delta.len() - 3]),
            Err(DeltaError::Truncated)
        );
        assert!(matches!(
            apply(&original[..10], &delta),
            Err(DeltaError::CopyOutOfRange { .. })
        ));

        let mut bad_op = delta.clone();
        bad_op[16] = 0x7f;
        assert_eq!(apply(&original, &bad_op), Err(DeltaError::UnknownOp(0x7f)));
    }
}
