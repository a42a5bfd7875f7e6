//! Section layout: the block holds one UTF-8 JSON object, possibly followed
//! by NUL padding added by the container.

use super::Metadata;
use crate::error::{EmptyBlock, InvalidUtf8, Json, Result};
use snafu::{ensure, ResultExt};
use std::str;

pub fn decode(contents: &[u8]) -> Result<Metadata> {
    let end = contents
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    ensure!(end > 0, EmptyBlock);

    let json = str::from_utf8(&contents[..end]).context(InvalidUtf8)?;
    serde_json::from_str(json).context(Json)
}

pub fn encode(metadata: &Metadata) -> Result<Vec<u8>> {
    serde_json::to_vec(metadata).context(Json)
}
