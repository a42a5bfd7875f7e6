//! The record a patched binary carries about itself, and the two ways it is
//! stored: as the contents of a named section, or as a trailer appended to
//! the byte stream.

pub mod section;
pub mod trailer;

use crate::error::Result;
use crate::hash::same_hash;
use crate::patch::AppliedPatch;
use log::warn;
use serde::{Deserialize, Serialize};

/// Section name used by default for the section layout.
pub const DEFAULT_SECTION: &str = "QPATCH.I";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    /// Hash of the tool build that wrote the record.
    pub hash_patching_program: String,
    /// Hash of the patch target region before the first patch.
    pub hash_original_program: Option<String>,
    #[serde(default)]
    pub applied_patches: Vec<AppliedPatch>,
}

impl Metadata {
    pub fn new(program_hash: &str) -> Self {
        Metadata {
            hash_patching_program: program_hash.to_string(),
            ..Metadata::default()
        }
    }
}

/// Where a binary keeps its metadata. Chosen once per binary.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MetadataLayout {
    /// JSON record as the whole contents of the named section.
    Section(String),
    /// Sentinel, hash fields and JSON list appended after the image.
    Trailer,
}

impl Default for MetadataLayout {
    fn default() -> Self {
        MetadataLayout::Section(DEFAULT_SECTION.to_string())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MetadataLoad {
    Unpatched,
    Patched(Metadata),
    PatchedVersionMismatch(Metadata),
    Corrupted,
}

impl MetadataLoad {
    /// Turns a decoded block into a load result. Decode failures are reported
    /// as corruption and never partially recovered.
    pub fn classify(decoded: Result<Metadata>, program_hash: &str) -> Self {
        match decoded {
            Ok(metadata) => {
                if same_hash(&metadata.hash_patching_program, program_hash) {
                    MetadataLoad::Patched(metadata)
                } else {
                    MetadataLoad::PatchedVersionMismatch(metadata)
                }
            }
            Err(e) => {
                warn!("Discarding unreadable metadata: {}", e);
                MetadataLoad::Corrupted
            }
        }
    }
}
