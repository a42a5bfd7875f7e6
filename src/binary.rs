//! The patch engine. A `PatchedBinary` owns one executable image, knows
//! whether and by whom it was patched, applies variants to it and produces
//! the bytes to write back.

use crate::error::{
    BackupNotPristine, BaselineMismatch, CorruptedMetadata, ReplacementOutOfBounds, Result,
    WriteFile,
};
use crate::hash::{same_hash, sha512_hex};
use crate::image::Image;
use crate::metadata::trailer::{self, Location};
use crate::metadata::{section, Metadata, MetadataLayout, MetadataLoad};
use crate::patch::{AppliedPatch, PatchDefinition, PatchFile, PatchVariant};
use crate::pattern::{compile_bytes, Pattern};
use crate::scan::{find_unique, Match};
use log::{debug, info, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::convert::TryFrom;
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatchStatus {
    Unpatched,
    Patched,
    /// Patched by a different build of this tool.
    PatchedVersionMismatch,
    /// Metadata is present but unreadable.
    Corrupted,
}

/// What happened to a variant that was well-formed. Configuration problems
/// are errors instead.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ApplyOutcome {
    Applied,
    NotFound { patch: String },
    Ambiguous { patch: String, matches: usize },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        *self == ApplyOutcome::Applied
    }
}

/// A patch with its pattern and replacement bytes compiled for one variant.
struct Compiled<'a> {
    patch: &'a PatchDefinition,
    pattern: Pattern,
    replacements: Vec<(i64, Vec<u8>)>,
}

pub struct PatchedBinary<I> {
    image: I,
    layout: MetadataLayout,
    metadata: Metadata,
    /// Trailer bytes detached from the stream, re-appended on output.
    trailer: Option<Vec<u8>>,
    status: PatchStatus,
}

impl<I: Image> PatchedBinary<I> {
    /// Parses `bytes` and classifies the metadata it carries. Only an image
    /// that cannot be parsed at all is an error.
    pub fn load(bytes: Vec<u8>, program_hash: &str, layout: MetadataLayout) -> Result<Self> {
        let (image, trailer, load) = match &layout {
            MetadataLayout::Trailer => match trailer::locate(&bytes) {
                Location::Absent => (I::from_bytes(bytes)?, None, MetadataLoad::Unpatched),
                Location::At(at) => {
                    let decoded = trailer::decode(&bytes[at..]);
                    let load = MetadataLoad::classify(decoded, program_hash);
                    let (image, trailer) = detach_trailer::<I>(bytes, at)?;
                    if trailer.is_some() {
                        (image, trailer, load)
                    } else {
                        (image, None, MetadataLoad::Corrupted)
                    }
                }
                Location::Duplicated(at) => {
                    warn!("Metadata sentinel appears more than once");
                    let (image, trailer) = detach_trailer::<I>(bytes, at)?;
                    (image, trailer, MetadataLoad::Corrupted)
                }
            },
            MetadataLayout::Section(name) => {
                let image = I::from_bytes(bytes)?;
                let load = match image.block(name) {
                    Some(contents) => {
                        MetadataLoad::classify(section::decode(contents), program_hash)
                    }
                    None => MetadataLoad::Unpatched,
                };
                (image, None, load)
            }
        };

        let (status, metadata) = match load {
            MetadataLoad::Unpatched => (PatchStatus::Unpatched, Metadata::new(program_hash)),
            MetadataLoad::Patched(metadata) => (PatchStatus::Patched, metadata),
            MetadataLoad::PatchedVersionMismatch(metadata) => {
                warn!(
                    "Binary was patched by a different program build ({})",
                    metadata.hash_patching_program
                );
                (PatchStatus::PatchedVersionMismatch, metadata)
            }
            MetadataLoad::Corrupted => (PatchStatus::Corrupted, Metadata::new(program_hash)),
        };
        info!(
            "Loaded binary: {:?}, {} applied patches",
            status,
            metadata.applied_patches.len()
        );

        Ok(PatchedBinary {
            image,
            layout,
            metadata,
            trailer,
            status,
        })
    }

    /// Replaces the loaded binary, keeping the layout.
    pub fn reload(&mut self, bytes: Vec<u8>, program_hash: &str) -> Result<PatchStatus> {
        *self = PatchedBinary::load(bytes, program_hash, self.layout.clone())?;
        Ok(self.status)
    }

    pub fn status(&self) -> PatchStatus {
        self.status
    }

    pub fn layout(&self) -> &MetadataLayout {
        &self.layout
    }

    pub fn image(&self) -> &I {
        &self.image
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn applied_patches(&self) -> &[AppliedPatch] {
        &self.metadata.applied_patches
    }

    pub fn program_hash(&self) -> &str {
        &self.metadata.hash_patching_program
    }

    pub fn original_hash(&self) -> Option<&str> {
        self.metadata.hash_original_program.as_deref()
    }

    /// SHA-512 of the target region, uppercase hex. Metadata is never part
    /// of the target region.
    pub fn binary_hash(&self) -> String {
        sha512_hex(self.image.target())
    }

    /// Applies every patch of `variant`. Nothing is written unless each
    /// pattern matches exactly once; the writes then happen in the variant's
    /// order and the variant is recorded in the metadata.
    pub fn apply_patch(&mut self, file: &PatchFile, variant: &PatchVariant) -> Result<ApplyOutcome> {
        ensure!(self.status != PatchStatus::Corrupted, CorruptedMetadata);
        if self.status == PatchStatus::PatchedVersionMismatch {
            warn!(
                "Applying '{}' ({}) to a binary patched by another program build",
                file.id, variant.id
            );
        }

        let compiled = compile(file, variant)?;

        let mut staged = self.image.target().to_vec();
        for entry in &compiled {
            let at = match find_unique(&staged, &entry.pattern) {
                Match::Unique(at) => at,
                Match::NotFound => {
                    warn!("Could not find a match for patch '{}'", entry.patch.id);
                    return Ok(ApplyOutcome::NotFound {
                        patch: entry.patch.id.clone(),
                    });
                }
                Match::Ambiguous(matches) => {
                    warn!(
                        "Pattern of patch '{}' matched {} times, only 1 match is supported",
                        entry.patch.id, matches
                    );
                    return Ok(ApplyOutcome::Ambiguous {
                        patch: entry.patch.id.clone(),
                        matches,
                    });
                }
            };
            debug!("Patch '{}' matched at 0x{:x}", entry.patch.id, at);

            for (index, bytes) in &entry.replacements {
                let offset = (at as i64).saturating_add(*index);
                let start = (at as i64)
                    .checked_add(*index)
                    .and_then(|offset| usize::try_from(offset).ok())
                    .filter(|start| {
                        start
                            .checked_add(bytes.len())
                            .map_or(false, |end| end <= staged.len())
                    })
                    .context(ReplacementOutOfBounds {
                        patch: entry.patch.id.as_str(),
                        offset,
                        len: bytes.len(),
                        region: staged.len(),
                    })?;
                staged[start..start + bytes.len()].copy_from_slice(bytes);
                debug!("Wrote {} bytes at 0x{:x}", bytes.len(), start);
            }
        }

        self.commit(staged, AppliedPatch::new(file, variant))?;
        info!("Applied patch '{}' variant '{}'", file.id, variant.id);
        Ok(ApplyOutcome::Applied)
    }

    /// Records `applied` and stores the metadata, then replaces the target
    /// region. On the first application the original hash is taken from the
    /// still pristine region.
    fn commit(&mut self, staged: Vec<u8>, applied: AppliedPatch) -> Result<()> {
        let first = self.status == PatchStatus::Unpatched
            && self.metadata.hash_original_program.is_none();
        if first {
            self.metadata.hash_original_program = Some(self.binary_hash());
        }
        self.metadata.applied_patches.push(applied);

        if let Err(e) = self.store_metadata() {
            self.metadata.applied_patches.pop();
            if first {
                self.metadata.hash_original_program = None;
            }
            return Err(e);
        }

        self.image.target_mut().copy_from_slice(&staged);
        if self.status == PatchStatus::Unpatched {
            self.status = PatchStatus::Patched;
        }
        Ok(())
    }

    fn store_metadata(&mut self) -> Result<()> {
        match &self.layout {
            MetadataLayout::Section(name) => {
                let contents = section::encode(&self.metadata)?;
                self.image.store_block(name, &contents)
            }
            MetadataLayout::Trailer => {
                self.trailer = Some(trailer::encode(&self.metadata)?);
                Ok(())
            }
        }
    }

    /// The complete binary including its metadata.
    pub fn full_binary(&self) -> Vec<u8> {
        let mut bytes = self.image.to_bytes();
        if let Some(trailer) = &self.trailer {
            bytes.extend_from_slice(trailer);
        }
        bytes
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.full_binary()).context(WriteFile { path })
    }
}

/// Parses the image in front of the sentinel at `at` and keeps the rest as
/// the trailer. When the bytes before the sentinel are not a complete image the
/// sentinel lies inside it, and the whole stream is parsed with no trailer.
fn detach_trailer<I: Image>(
    mut bytes: Vec<u8>,
    at: usize,
) -> Result<(I, Option<Vec<u8>>)> {
    match I::from_bytes(bytes[..at].to_vec()) {
        Ok(image) => {
            let tail = bytes.split_off(at);
            Ok((image, Some(tail)))
        }
        Err(e) => {
            warn!("Metadata sentinel at 0x{:x} is inside the image: {}", at, e);
            Ok((I::from_bytes(bytes)?, None))
        }
    }
}

fn compile<'a>(file: &'a PatchFile, variant: &PatchVariant) -> Result<Vec<Compiled<'a>>> {
    file.resolve(variant)?
        .into_iter()
        .map(|patch| {
            let pattern = Pattern::compile(patch, variant)?;
            let replacements = patch
                .replacements
                .iter()
                .map(|r| Ok((r.index, compile_bytes(&r.bytes, variant)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Compiled {
                patch,
                pattern,
                replacements,
            })
        })
        .collect()
}

/// Checks that `backup` is the unpatched baseline `binary` was (or would be)
/// patched from.
pub fn verify_baseline<I: Image, J: Image>(
    binary: &PatchedBinary<I>,
    backup: &PatchedBinary<J>,
) -> Result<()> {
    ensure!(backup.status() == PatchStatus::Unpatched, BackupNotPristine);

    let expected = match binary.status() {
        PatchStatus::Corrupted => return CorruptedMetadata.fail(),
        PatchStatus::Unpatched => binary.binary_hash(),
        PatchStatus::Patched | PatchStatus::PatchedVersionMismatch => {
            if binary.status() == PatchStatus::PatchedVersionMismatch {
                warn!("Verifying a binary patched by a different program build");
            }
            match binary.original_hash() {
                Some(hash) => hash.to_string(),
                None => binary.binary_hash(),
            }
        }
    };

    let backup_hash = backup.binary_hash();
    ensure!(
        same_hash(&backup_hash, &expected),
        BaselineMismatch {
            backup: backup_hash,
            expected,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::image::pe::testing::minimal_pe;
    use crate::image::{FlatImage, PeImage};
    use crate::metadata::DEFAULT_SECTION;
    use crate::patch::{PatchReplacement, VariantVariable};
    use pretty_assertions::assert_eq;

    const PROGRAM: &str = "PROGRAM";

    fn code() -> Vec<u8> {
        vec![
            0x55, 0x48, 0x89, 0xE5, 0x83, 0xF8, 0x05, 0x7E, 0x10, 0x31, 0xC0, 0x5D, 0xC3,
        ]
    }

    fn patch_file() -> PatchFile {
        PatchFile {
            id: "limit".to_string(),
            name: "Remove limit".to_string(),
            patches: vec![PatchDefinition {
                id: "cmp".to_string(),
                pattern: vec!["83 F8 %LIMIT%".to_string(), "7E **".to_string()],
                replacements: vec![PatchReplacement {
                    index: 3,
                    bytes: "%JUMP%".to_string(),
                }],
            }],
            variants: vec![PatchVariant {
                id: "skip".to_string(),
                name: "Skip".to_string(),
                patches: vec!["CMP".to_string()],
                variables: vec![
                    VariantVariable {
                        variable: "LIMIT".to_string(),
                        value: "05".to_string(),
                    },
                    VariantVariable {
                        variable: "JUMP".to_string(),
                        value: "EB".to_string(),
                    },
                ],
            }],
            ..PatchFile::default()
        }
    }

    #[test]
    fn applies_into_pe_section() {
        let pristine = minimal_pe(&code());
        let mut binary =
            PatchedBinary::<PeImage>::load(pristine.clone(), PROGRAM, MetadataLayout::default())
                .unwrap();
        assert_eq!(binary.status(), PatchStatus::Unpatched);
        let original = binary.binary_hash();

        let file = patch_file();
        let outcome = binary.apply_patch(&file, &file.variants[0]).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(binary.image().target()[7], 0xEB);
        assert_eq!(binary.original_hash(), Some(original.as_str()));

        let saved = binary.full_binary();
        let reloaded =
            PatchedBinary::<PeImage>::load(saved, PROGRAM, MetadataLayout::default()).unwrap();
        assert_eq!(reloaded.status(), PatchStatus::Patched);
        assert_eq!(
            reloaded.applied_patches(),
            &[AppliedPatch {
                patch: "limit".to_string(),
                variant: "skip".to_string()
            }]
        );
        assert!(reloaded.image().block(DEFAULT_SECTION).is_some());

        let backup = PatchedBinary::<PeImage>::load(pristine, PROGRAM, MetadataLayout::default())
            .unwrap();
        verify_baseline(&reloaded, &backup).unwrap();
        assert!(matches!(
            verify_baseline(&backup, &reloaded),
            Err(Error::BackupNotPristine)
        ));
    }

    #[test]
    fn second_match_pass_sees_earlier_writes() {
        let mut file = patch_file();
        file.patches.push(PatchDefinition {
            id: "after".to_string(),
            pattern: vec!["EB 10".to_string()],
            replacements: vec![PatchReplacement {
                index: 1,
                bytes: "20".to_string(),
            }],
        });
        file.variants[0].patches.push("after".to_string());

        let mut binary =
            PatchedBinary::<FlatImage>::load(code(), PROGRAM, MetadataLayout::Trailer).unwrap();
        let outcome = binary.apply_patch(&file, &file.variants[0]).unwrap();
        assert!(outcome.is_applied());
        assert_eq!(&binary.image().target()[7..9], &[0xEB, 0x20]);
    }

    #[test]
    fn failed_variant_writes_nothing() {
        let mut file = patch_file();
        file.patches.push(PatchDefinition {
            id: "absent".to_string(),
            pattern: vec!["CC CC".to_string()],
            replacements: Vec::new(),
        });
        file.variants[0].patches.push("absent".to_string());

        let mut binary =
            PatchedBinary::<FlatImage>::load(code(), PROGRAM, MetadataLayout::Trailer).unwrap();
        let outcome = binary.apply_patch(&file, &file.variants[0]).unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::NotFound {
                patch: "absent".to_string()
            }
        );
        assert_eq!(binary.full_binary(), code());
        assert_eq!(binary.status(), PatchStatus::Unpatched);
        assert!(binary.applied_patches().is_empty());
    }

    #[test]
    fn out_of_bounds_replacement_is_a_configuration_error() {
        let mut file = patch_file();
        file.patches[0].replacements[0].index = -20;
        let mut binary =
            PatchedBinary::<FlatImage>::load(code(), PROGRAM, MetadataLayout::Trailer).unwrap();
        let err = binary.apply_patch(&file, &file.variants[0]).unwrap_err();
        assert!(matches!(err, Error::ReplacementOutOfBounds { offset: -16, .. }), "{:?}", err);
        assert_eq!(binary.full_binary(), code());
    }

    #[test]
    fn overflowing_replacement_index_is_a_configuration_error() {
        let mut file = patch_file();
        file.patches[0].replacements[0].index = i64::MAX;
        let mut binary =
            PatchedBinary::<FlatImage>::load(code(), PROGRAM, MetadataLayout::Trailer).unwrap();
        let err = binary.apply_patch(&file, &file.variants[0]).unwrap_err();
        assert!(
            matches!(err, Error::ReplacementOutOfBounds { offset: i64::MAX, .. }),
            "{:?}",
            err
        );

        file.patches[0].replacements[0].index = i64::MIN;
        let err = binary.apply_patch(&file, &file.variants[0]).unwrap_err();
        assert!(matches!(err, Error::ReplacementOutOfBounds { .. }), "{:?}", err);
        assert_eq!(binary.full_binary(), code());
    }

    #[test]
    fn sentinel_inside_code_is_corrupted_not_fatal() {
        let mut text = vec![0x90u8; 16];
        text.extend_from_slice(trailer::SENTINEL);
        let bytes = minimal_pe(&text);

        let binary =
            PatchedBinary::<PeImage>::load(bytes.clone(), PROGRAM, MetadataLayout::Trailer)
                .unwrap();
        assert_eq!(binary.status(), PatchStatus::Corrupted);
        assert_eq!(&binary.image().target()[16..32], trailer::SENTINEL);
        assert_eq!(binary.full_binary(), bytes);

        text.extend_from_slice(trailer::SENTINEL);
        let bytes = minimal_pe(&text);
        let binary =
            PatchedBinary::<PeImage>::load(bytes.clone(), PROGRAM, MetadataLayout::Trailer)
                .unwrap();
        assert_eq!(binary.status(), PatchStatus::Corrupted);
        assert_eq!(binary.full_binary(), bytes);
    }

    #[test]
    fn flat_image_cannot_hold_sections() {
        let file = patch_file();
        let mut binary =
            PatchedBinary::<FlatImage>::load(code(), PROGRAM, MetadataLayout::default()).unwrap();
        let err = binary.apply_patch(&file, &file.variants[0]).unwrap_err();
        assert!(matches!(err, Error::BlocksUnsupported { .. }), "{:?}", err);
        assert_eq!(binary.full_binary(), code());
        assert!(binary.original_hash().is_none());
    }
}
