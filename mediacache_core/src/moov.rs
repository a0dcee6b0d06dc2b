//! MP4 `moov` atom position heuristic (spec §4.2).
//!
//! Box-header parsing is grounded in the ISOBMFF reader used for fragment
//! validation elsewhere in the pack (`crates/mp4/src/box_utils.rs`): read a
//! big-endian 32-bit size, a 4-byte FourCC, and step to the next box by
//! `size`. We only need a linear walk over the first few top-level boxes,
//! so unlike that reader we don't need 64-bit extended sizes or owned
//! `Bytes` slices — a plain `&[u8]` is enough.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoovPosition {
    Unknown,
    AtStart,
    AtEnd,
}

impl MoovPosition {
    pub fn is_known(self) -> bool {
        !matches!(self, MoovPosition::Unknown)
    }

    pub fn is_at_end(self) -> bool {
        matches!(self, MoovPosition::AtEnd)
    }
}

/// Read one top-level box header at `offset`: `(total_size, fourcc)`.
/// Returns `None` if fewer than 8 bytes remain (can't even read the header).
fn read_box_header(data: &[u8], offset: usize) -> Option<(u64, [u8; 4])> {
    if data.len() < offset + 8 {
        return None;
    }
    let size = u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]) as u64;
    let fourcc = [
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ];
    Some((size, fourcc))
}

/// Detect whether `moov` sits at the start or end of the file from a
/// leading byte sample (spec default: first 64 bytes, `moovDetectionBytes`).
///
/// Walks top-level boxes from offset 0, skipping `ftyp`. The first
/// non-`ftyp` box encountered decides: `moov` → `AtStart`; anything else
/// (typically `mdat`, `free`, or `wide` ahead of a trailing `moov`) →
/// `AtEnd`. Insufficient data to find a decisive box also returns `AtEnd` —
/// the conservative choice, since it triggers tail prefetch rather than
/// risking a player stall waiting on metadata that never arrives.
pub fn detect_moov_position(leading_bytes: &[u8]) -> MoovPosition {
    let mut offset = 0usize;
    loop {
        let Some((size, fourcc)) = read_box_header(leading_bytes, offset) else {
            return MoovPosition::AtEnd;
        };
        if &fourcc == b"ftyp" {
            if size == 0 {
                return MoovPosition::AtEnd;
            }
            offset += size as usize;
            continue;
        }
        return if &fourcc == b"moov" {
            MoovPosition::AtStart
        } else {
            MoovPosition::AtEnd
        };
    }
}

/// Should `moov` detection be skipped for a file of this size? Spec: files
/// below `skipMoovDetectionThreshold` (default 5 MiB) skip detection and
/// assume at-start (no tail prefetch needed for something this small).
pub fn should_skip_detection(content_length: u64, threshold: u64) -> bool {
    content_length < threshold
}
