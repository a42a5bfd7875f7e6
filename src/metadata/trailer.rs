//! Trailer layout, appended to the end of the byte stream:
//!
//! ```text
//! SENTINEL[16] | PROGRAM_HASH[128] | ORIGINAL_HASH[128] | LEN[4, i32 LE] | JSON[LEN]
//! ```
//!
//! Hash fields are ASCII text padded with NUL. The JSON is the list of applied
//! patches only.

use super::Metadata;
use crate::error::{
    Bincode, HashFieldTooLong, InvalidTrailerLength, InvalidUtf8, Json, Result, TrailingData,
    TruncatedTrailer,
};
use crate::hash::HASH_LEN;
use crate::patch::AppliedPatch;
use crate::pattern::Pattern;
use crate::scan::find_all;
use snafu::{ensure, ResultExt};
use std::str;

pub const SENTINEL: &[u8] = b"QPATCH.I:TRAILER";

const LEN_WIDTH: usize = 4;
const HEADER_LEN: usize = SENTINEL.len() + 2 * HASH_LEN + LEN_WIDTH;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    Absent,
    At(usize),
    /// More than one sentinel; the offset is the first one.
    Duplicated(usize),
}

/// Looks for the sentinel anywhere in `bytes`.
pub fn locate(bytes: &[u8]) -> Location {
    let found = find_all(bytes, &Pattern::literal(SENTINEL));
    match found.as_slice() {
        [] => Location::Absent,
        [at] => Location::At(*at),
        [first, ..] => Location::Duplicated(*first),
    }
}

/// Decodes a trailer that starts with the sentinel and runs to the end of the
/// stream.
pub fn decode(trailer: &[u8]) -> Result<Metadata> {
    ensure!(
        trailer.len() >= HEADER_LEN,
        TruncatedTrailer {
            needed: HEADER_LEN,
            available: trailer.len()
        }
    );

    let mut offset = SENTINEL.len();
    let program = hash_field(&trailer[offset..offset + HASH_LEN])?;
    offset += HASH_LEN;
    let original = hash_field(&trailer[offset..offset + HASH_LEN])?;
    offset += HASH_LEN;

    let len: i32 = bincode::deserialize(&trailer[offset..offset + LEN_WIDTH]).context(Bincode)?;
    offset += LEN_WIDTH;
    ensure!(len >= 0, InvalidTrailerLength { len });

    let end = offset + len as usize;
    ensure!(
        end <= trailer.len(),
        TruncatedTrailer {
            needed: end,
            available: trailer.len()
        }
    );
    ensure!(
        end == trailer.len(),
        TrailingData {
            len: trailer.len() - end
        }
    );

    let json = str::from_utf8(&trailer[offset..end]).context(InvalidUtf8)?;
    let applied_patches: Vec<AppliedPatch> = serde_json::from_str(json).context(Json)?;

    Ok(Metadata {
        hash_patching_program: program,
        hash_original_program: if original.is_empty() {
            None
        } else {
            Some(original)
        },
        applied_patches,
    })
}

pub fn encode(metadata: &Metadata) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(&metadata.applied_patches).context(Json)?;
    let len = json.len() as i32;
    ensure!(len >= 0, InvalidTrailerLength { len });

    let mut trailer = Vec::with_capacity(HEADER_LEN + json.len());
    trailer.extend_from_slice(SENTINEL);
    push_hash_field(&mut trailer, &metadata.hash_patching_program)?;
    push_hash_field(
        &mut trailer,
        metadata.hash_original_program.as_deref().unwrap_or(""),
    )?;
    trailer.extend(bincode::serialize(&len).context(Bincode)?);
    trailer.extend(json);
    Ok(trailer)
}

fn hash_field(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let text = str::from_utf8(&field[..end]).context(InvalidUtf8)?;
    Ok(text.to_string())
}

fn push_hash_field(trailer: &mut Vec<u8>, hash: &str) -> Result<()> {
    ensure!(
        hash.len() <= HASH_LEN && !hash.contains('\0'),
        HashFieldTooLong {
            hash,
            width: HASH_LEN
        }
    );
    trailer.extend_from_slice(hash.as_bytes());
    trailer.resize(trailer.len() + HASH_LEN - hash.len(), 0);
    Ok(())
}
