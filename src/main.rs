use clap::arg_enum;
use log::{error, info, warn};
use patcher::hash::sha512_hex;
use patcher::{
    select_applied, verify_baseline, FlatImage, Image, MetadataLayout, PatchFile, PatchStatus,
    PatchVariant, PatchedBinary, PeImage,
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::fs;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

arg_enum! {
    #[derive(Debug)]
    enum Mode {
        Status,
        Apply
    }
}

arg_enum! {
    #[derive(Debug)]
    enum Layout {
        Section,
        Trailer
    }
}

arg_enum! {
    #[derive(Debug)]
    enum ImageKind {
        Pe,
        Flat
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "patcher", about = "Applies pattern based patches to an executable")]
struct Options {
    #[structopt(
        short,
        long,
        possible_values = &Mode::variants(),
        case_insensitive = true,
        default_value = "Status"
    )]
    mode: Mode,
    /// Where the applied patches are recorded
    #[structopt(
        short,
        long,
        possible_values = &Layout::variants(),
        case_insensitive = true,
        default_value = "Section"
    )]
    layout: Layout,
    #[structopt(long, default_value = "QPATCH.I")]
    section_name: String,
    #[structopt(
        short,
        long,
        possible_values = &ImageKind::variants(),
        case_insensitive = true,
        default_value = "Pe"
    )]
    image: ImageKind,
    /// Patch definition files
    #[structopt(short, long, number_of_values = 1, parse(from_os_str))]
    patches: Vec<PathBuf>,
    /// Variants to apply, as PATCH or PATCH:VARIANT
    #[structopt(short, long, number_of_values = 1)]
    select: Vec<String>,
    /// Apply again the variants already recorded in the binary
    #[structopt(short, long)]
    keep_applied: bool,
    /// Identity of this program build, defaults to the hash of the executable
    #[structopt(long)]
    program_hash: Option<String>,
    /// Pristine copy of the binary, defaults to BINARY.original
    #[structopt(long, parse(from_os_str))]
    backup: Option<PathBuf>,
    /// Write the binary even if some patches failed
    #[structopt(long)]
    force_save: bool,
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    #[structopt(short, long)]
    quiet: bool,
    #[structopt(index = 1, required = true, name = "BINARY", parse(from_os_str))]
    input: PathBuf,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{}", source))]
    Patcher { source: patcher::Error },

    #[snafu(display("Unable to read {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to copy the original binary to {}: {}", path.display(), source))]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("The binary is not an original unpatched binary, no backup can be made from it"))]
    NotOriginal,

    #[snafu(display("No loaded patch has the id '{}'", id))]
    UnknownPatch { id: String },

    #[snafu(display("Patch '{}' has {} variants, select one as {}:VARIANT", id, count, id))]
    VariantRequired { id: String, count: usize },

    #[snafu(display("Only {} of {} patches applied, binary not written", applied, total))]
    Incomplete { applied: usize, total: usize },
}

impl From<patcher::Error> for CliError {
    fn from(source: patcher::Error) -> Self {
        CliError::Patcher { source }
    }
}

fn main() {
    let opt = Options::from_args();

    let level = match (opt.verbose, opt.quiet) {
        (0, true) => "error",
        (0, false) => "warn",
        (1, _) => "info",
        (2, _) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&opt) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(opt: &Options) -> Result<(), CliError> {
    let layout = match opt.layout {
        Layout::Section => MetadataLayout::Section(opt.section_name.clone()),
        Layout::Trailer => MetadataLayout::Trailer,
    };
    match opt.image {
        ImageKind::Pe => execute::<PeImage>(opt, layout),
        ImageKind::Flat => execute::<FlatImage>(opt, layout),
    }
}

fn execute<I: Image>(opt: &Options, layout: MetadataLayout) -> Result<(), CliError> {
    let program_hash = match &opt.program_hash {
        Some(hash) => hash.clone(),
        None => own_hash()?,
    };
    info!("Program hash {}", program_hash);

    let files = opt
        .patches
        .iter()
        .map(|path| PatchFile::from_path(path))
        .collect::<patcher::Result<Vec<_>>>()?;
    info!("Loaded {} patch files", files.len());

    let bytes = fs::read(&opt.input).context(Read { path: &opt.input })?;
    let binary = PatchedBinary::<I>::load(bytes, &program_hash, layout.clone())?;

    match opt.mode {
        Mode::Status => {
            print_status(&binary, &files);
            Ok(())
        }
        Mode::Apply => apply(opt, &binary, &files, &program_hash, layout),
    }
}

fn own_hash() -> Result<String, CliError> {
    let path = std::env::current_exe().context(Read { path: "<current executable>" })?;
    let bytes = fs::read(&path).context(Read { path: &path })?;
    Ok(sha512_hex(&bytes))
}

fn print_status<I: Image>(binary: &PatchedBinary<I>, files: &[PatchFile]) {
    println!("Status: {:?}", binary.status());
    println!("Binary hash: {}", binary.binary_hash());
    if binary.status() == PatchStatus::Unpatched || binary.status() == PatchStatus::Corrupted {
        return;
    }

    println!("Patched by: {}", binary.program_hash());
    println!(
        "Original hash: {}",
        binary.original_hash().unwrap_or("<unknown>")
    );
    println!("Applied patches: {}", binary.applied_patches().len());
    for applied in binary.applied_patches() {
        println!("  {} / {}", applied.patch, applied.variant);
    }
    if files.is_empty() {
        return;
    }
    for (file, variant) in select_applied(files, binary.applied_patches()) {
        println!("[X] {} ({})", file.name, variant.name);
        println!("    {}", file.description);
    }
}

fn backup_path(opt: &Options) -> PathBuf {
    opt.backup.clone().unwrap_or_else(|| {
        let mut path = opt.input.clone().into_os_string();
        path.push(".original");
        PathBuf::from(path)
    })
}

fn select<'a>(
    files: &'a [PatchFile],
    selector: &str,
) -> Result<(&'a PatchFile, &'a PatchVariant), CliError> {
    let mut parts = selector.splitn(2, ':');
    let id = parts.next().unwrap_or_default();
    let file = files
        .iter()
        .find(|f| f.id.eq_ignore_ascii_case(id))
        .context(UnknownPatch { id })?;

    let variant = match parts.next() {
        Some(variant) => file.variant(variant).ok_or_else(|| patcher::Error::VariantNotFound {
            patch: file.id.clone(),
            variant: variant.to_string(),
        })?,
        None => {
            ensure!(
                file.variants.len() == 1,
                VariantRequired {
                    id: file.id.as_str(),
                    count: file.variants.len()
                }
            );
            &file.variants[0]
        }
    };
    Ok((file, variant))
}

fn apply<I: Image>(
    opt: &Options,
    binary: &PatchedBinary<I>,
    files: &[PatchFile],
    program_hash: &str,
    layout: MetadataLayout,
) -> Result<(), CliError> {
    let backup_path = backup_path(opt);
    if !backup_path.exists() {
        info!("No original backup found, creating {}", backup_path.display());
        ensure!(binary.status() == PatchStatus::Unpatched, NotOriginal);
        fs::copy(&opt.input, &backup_path).context(Backup { path: &backup_path })?;
    }

    let original = fs::read(&backup_path).context(Read { path: &backup_path })?;
    let backup = PatchedBinary::<I>::load(original.clone(), program_hash, layout.clone())?;
    verify_baseline(binary, &backup)?;
    info!("Backup {} matches the binary", backup_path.display());

    let mut selection = if opt.keep_applied && binary.status() == PatchStatus::Patched {
        select_applied(files, binary.applied_patches())
    } else {
        Vec::new()
    };
    for selector in &opt.select {
        let (file, variant) = select(files, selector)?;
        match selection.iter_mut().find(|(f, _)| f.id == file.id) {
            Some(entry) => entry.1 = variant,
            None => selection.push((file, variant)),
        }
    }
    if selection.is_empty() {
        warn!("No patches selected, the binary will be restored to the original");
    }

    let mut patched = PatchedBinary::<I>::load(original, program_hash, layout)?;
    let mut applied = 0;
    for (file, variant) in &selection {
        println!("Applying patch '{}' variant '{}'...", file.name, variant.name);
        match patched.apply_patch(file, variant) {
            Ok(outcome) if outcome.is_applied() => applied += 1,
            Ok(outcome) => {
                error!("Failed to apply patch '{}': {:?}", file.id, outcome);
                break;
            }
            Err(e) => {
                error!("Failed to apply patch '{}': {}", file.id, e);
                break;
            }
        }
    }
    println!("{} patches applied", applied);

    ensure!(
        applied == selection.len() || opt.force_save,
        Incomplete {
            applied,
            total: selection.len()
        }
    );
    write(&patched, &opt.input)
}

fn write<I: Image>(binary: &PatchedBinary<I>, path: &Path) -> Result<(), CliError> {
    binary.save(path)?;
    println!("Wrote patched binary to '{}'", path.display());
    Ok(())
}
