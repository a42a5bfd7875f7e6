//! Pattern based binary patching with a self-describing record of the applied
//! patches stored inside the patched executable.

pub mod binary;
pub mod error;
pub mod hash;
pub mod image;
pub mod metadata;
pub mod patch;
pub mod pattern;
pub mod scan;

pub use binary::{verify_baseline, ApplyOutcome, PatchStatus, PatchedBinary};
pub use error::{Error, Result};
pub use image::{FlatImage, Image, PeImage};
pub use metadata::{Metadata, MetadataLayout, MetadataLoad};
pub use patch::{select_applied, AppliedPatch, PatchDefinition, PatchFile, PatchVariant};
