use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
    // Patch definitions and variants.
    #[snafu(display("Could not find patch with id '{}'", id))]
    PatchNotFound { id: String },

    #[snafu(display("Could not find variant '{}' in patch '{}'", variant, patch))]
    VariantNotFound { patch: String, variant: String },

    #[snafu(display("Variable '%{}%' is not bound by variant '{}'", name, variant))]
    UnboundVariable { name: String, variant: String },

    #[snafu(display("Pattern of patch '{}' is empty", patch))]
    EmptyPattern { patch: String },

    #[snafu(display("Hex string '{}' has an odd number of digits", text))]
    OddHexDigits { text: String },

    #[snafu(display("Invalid hex byte '{}' in '{}'", token, text))]
    InvalidHex { token: String, text: String },

    #[snafu(display("Replacement bytes '{}' contain a wildcard", text))]
    WildcardInReplacement { text: String },

    #[snafu(display(
        "Replacement of {} bytes at offset {} is outside the {} byte target region (patch '{}')",
        len,
        offset,
        region,
        patch
    ))]
    ReplacementOutOfBounds {
        patch: String,
        offset: i64,
        len: usize,
        region: usize,
    },

    #[snafu(display("Hash '{}' does not fit the {} byte trailer field", hash, width))]
    HashFieldTooLong { hash: String, width: usize },

    // Integrity.
    #[snafu(display("Metadata of the binary is corrupted, refusing to patch it"))]
    CorruptedMetadata,

    #[snafu(display("The backup binary is not an unpatched original"))]
    BackupNotPristine,

    #[snafu(display(
        "Backup hash {} does not match the expected baseline {}",
        backup,
        expected
    ))]
    BaselineMismatch { backup: String, expected: String },

    // Metadata framing; these never escape a load, they become `PatchStatus::Corrupted`.
    #[snafu(display("Trailer needs {} bytes but only {} are present", needed, available))]
    TruncatedTrailer { needed: usize, available: usize },

    #[snafu(display("Trailer length prefix {} is invalid", len))]
    InvalidTrailerLength { len: i32 },

    #[snafu(display("{} unexpected bytes after the trailer", len))]
    TrailingData { len: usize },

    #[snafu(display("Metadata block is empty"))]
    EmptyBlock,

    #[snafu(display("Metadata is not valid UTF-8: {}", source))]
    InvalidUtf8 { source: std::str::Utf8Error },

    #[snafu(display("Invalid JSON: {}", source))]
    Json { source: serde_json::Error },

    #[snafu(display("Invalid trailer framing: {}", source))]
    Bincode { source: bincode::Error },

    // Containers.
    #[snafu(display("Unable to parse executable: {}", source))]
    MalformedImage { source: goblin::error::Error },

    #[snafu(display("Malformed executable: {}", reason))]
    InvalidImage { reason: String },

    #[snafu(display("Executable has no code section"))]
    MissingCodeSection,

    #[snafu(display("Image does not support named blocks (wanted '{}')", name))]
    BlocksUnsupported { name: String },

    #[snafu(display("Section name '{}' is longer than 8 bytes", name))]
    BlockNameTooLong { name: String },

    #[snafu(display("Section '{}' is the patch target and cannot hold metadata", name))]
    BlockIsTarget { name: String },

    #[snafu(display(
        "Section '{}' holds {} bytes, {} needed and it cannot grow",
        name,
        capacity,
        len
    ))]
    BlockTooLarge {
        name: String,
        len: usize,
        capacity: usize,
    },

    #[snafu(display("No room left in the section table for '{}'", name))]
    SectionTableFull { name: String },

    // Files.
    #[snafu(display("Unable to read {}: {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to write {}: {}", path.display(), source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
