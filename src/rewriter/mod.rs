//! Adjusting the dynamic-linker search paths of native artifacts.
//!
//! When internal shared libraries are relocated into the hidden
//! `.{distname}.mesonpy.libs` directory, every binary referencing them must
//! learn the new location. Rewriting is strictly local: search path
//! entries change, symbols and link order do not. Each platform has its own
//! editor; the replacement policy is shared.
//!
//! Entries relative to the origin token (`$ORIGIN`, `@loader_path`) were
//! put there by Meson to point into the build tree; after relocation they
//! are redirected at the in-wheel libs directory. Absolute entries into the
//! build tree would dangle and are removed. Anything else is preserved.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{Error, Result};

mod elf;
mod macho;

/// The binary format family of the build platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    MachO,
    SunOsElf,
    /// No RPATH concept; relocation requires package cooperation and no
    /// in-place rewrite is performed.
    Pe,
}

impl BinaryFormat {
    /// Map `platform.system()` to the format family.
    pub fn from_system(system: &str) -> Self {
        match system {
            "darwin" | "ios" => BinaryFormat::MachO,
            "windows" | "cygwin" => BinaryFormat::Pe,
            "sunos" | "solaris" => BinaryFormat::SunOsElf,
            _ => BinaryFormat::Elf,
        }
    }

    fn origin(&self) -> &'static str {
        match self {
            BinaryFormat::MachO => "@loader_path",
            _ => "$ORIGIN",
        }
    }
}

/// Rewrites staged binaries for one build.
#[derive(Debug)]
pub struct Rewriter {
    format: BinaryFormat,
    build_dir: PathBuf,
}

impl Rewriter {
    pub fn new(format: BinaryFormat, build_dir: &Path) -> Self {
        Rewriter {
            format,
            build_dir: build_dir.to_path_buf(),
        }
    }

    /// Verify the external tools the rewriter shells out to are available.
    /// On Linux a missing patchelf fails the build before any file is
    /// touched.
    pub fn check_tools(&self) -> Result<()> {
        match self.format {
            BinaryFormat::Elf => elf::verify_patchelf(),
            BinaryFormat::MachO | BinaryFormat::SunOsElf | BinaryFormat::Pe => Ok(()),
        }
    }

    /// Rewrite one staged binary.
    ///
    /// `libs_rpath` is the path of the internal libs directory relative to
    /// the binary's install directory (`None` when the wheel bundles no
    /// internal libraries).
    pub fn fix_rpath(&self, file: &Path, libs_rpath: Option<&str>) -> Result<()> {
        if self.format == BinaryFormat::Pe {
            return Ok(());
        }

        let origin = self.format.origin();
        let old_rpath = self.get_rpath(file)?;
        let new_rpath = compute_new_rpath(&old_rpath, origin, &self.build_dir, libs_rpath);

        if new_rpath != old_rpath {
            debug!(
                file = %file.display(),
                ?old_rpath,
                ?new_rpath,
                "rewriting runtime search path"
            );
            self.set_rpath(file, &old_rpath, &new_rpath)?;
        }

        if self.format == BinaryFormat::MachO {
            macho::fix_load_dylibs(file, &self.build_dir, libs_rpath)?;
        }
        Ok(())
    }

    fn get_rpath(&self, file: &Path) -> Result<Vec<String>> {
        match self.format {
            BinaryFormat::Elf => elf::get_rpath(file),
            BinaryFormat::MachO => macho::get_rpath(file),
            BinaryFormat::SunOsElf => elf::sunos_get_rpath(file),
            BinaryFormat::Pe => Ok(Vec::new()),
        }
    }

    fn set_rpath(&self, file: &Path, old: &[String], new: &[String]) -> Result<()> {
        match self.format {
            BinaryFormat::Elf => elf::set_rpath(file, new),
            BinaryFormat::MachO => macho::set_rpath(file, old, new),
            BinaryFormat::SunOsElf => elf::sunos_set_rpath(file, new),
            BinaryFormat::Pe => Ok(()),
        }
    }
}

/// The replacement policy, as a pure function of the old entries.
///
/// With a libs directory, origin-relative entries were Meson's pointers
/// into the build tree and get redirected at it; without one they are
/// Meson's `install_rpath` values and must survive. Absolute entries into
/// the build tree dangle after install and are always dropped. Entries are
/// deduplicated preserving first occurrence so repeated builds produce
/// byte-identical binaries.
fn compute_new_rpath(
    old_rpath: &[String],
    origin: &str,
    build_dir: &Path,
    libs_rpath: Option<&str>,
) -> Vec<String> {
    let mut new_rpath: Vec<String> = Vec::new();
    for entry in old_rpath {
        let entry = if entry.split('/').next() == Some(origin) {
            match libs_rpath {
                Some(libs_rpath) => normalize_origin_entry(origin, libs_rpath),
                None => entry.clone(),
            }
        } else if Path::new(entry).starts_with(build_dir) {
            continue;
        } else {
            entry.clone()
        };
        if !new_rpath.contains(&entry) {
            new_rpath.push(entry);
        }
    }
    if let Some(libs_rpath) = libs_rpath {
        let entry = normalize_origin_entry(origin, libs_rpath);
        if !new_rpath.contains(&entry) {
            new_rpath.push(entry);
        }
    }
    new_rpath
}

/// `$ORIGIN` + `.` collapses to plain `$ORIGIN`.
fn normalize_origin_entry(origin: &str, libs_rpath: &str) -> String {
    if libs_rpath.is_empty() || libs_rpath == "." {
        origin.to_string()
    } else {
        format!("{origin}/{libs_rpath}")
    }
}

/// Whether the file looks like an ELF object (magic `\x7fELF`).
pub fn is_elf(path: &Path) -> Result<bool> {
    use std::io::Read;

    let mut magic = [0u8; 4];
    let mut file = fs_err::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == *b"\x7fELF"),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Whether the file looks like a Mach-O object (including fat binaries).
pub fn is_macho(path: &Path) -> Result<bool> {
    use std::io::Read;

    let mut magic = [0u8; 4];
    let mut file = fs_err::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(matches!(
            u32::from_be_bytes(magic),
            0xfeedface | 0xfeedfacf | 0xcefaedfe | 0xcffaedfe | 0xcafebabe
        )),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(Error::Io(err)),
    }
}
