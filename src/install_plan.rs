//! Mapping Meson's install plan onto the wheel layout.
//!
//! Meson expresses install destinations against scheme placeholders
//! (`{py_purelib}`, `{bindir}`, ...); wheels know a fixed set of locations.
//! The bridge between the two worlds is a single declarative table plus a
//! series of filtering and validation passes. Everything here is a pure
//! function of the introspection data, so mapping the same plan twice
//! yields the same result.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::meson::InstallPlan;
use crate::util::style;

/// Where a file lives inside the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WheelLocation {
    Purelib,
    Platlib,
    Scripts,
    Headers,
    Data,
    /// The hidden `.{distname}.mesonpy.libs` directory holding internal
    /// shared libraries relocated out of `{libdir_shared}`.
    InternalLibs,
}

impl WheelLocation {
    /// The scheme directory under `{distname}-{version}.data/` for
    /// locations that live there, `None` for root locations.
    pub fn data_scheme(&self) -> Option<&'static str> {
        match self {
            WheelLocation::Scripts => Some("scripts"),
            WheelLocation::Headers => Some("headers"),
            WheelLocation::Data => Some("data"),
            WheelLocation::Purelib | WheelLocation::Platlib | WheelLocation::InternalLibs => None,
        }
    }
}

/// What kind of file an install plan entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Executable,
    SharedLibrary,
    StaticLibrary,
    Header,
    Man,
    Data,
    PythonSource,
    ExtensionModule,
    Generic,
}

impl FileKind {
    /// Native artifacts get their dynamic-linker search path rewritten.
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            FileKind::Executable | FileKind::SharedLibrary | FileKind::ExtensionModule
        )
    }
}

/// One file Meson would install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlanEntry {
    /// Path in the source or build tree. For files installed as part of a
    /// directory this is the individual file, with [`plan_key`] holding the
    /// directory the install plan actually names.
    ///
    /// [`plan_key`]: InstallPlanEntry::plan_key
    pub source: PathBuf,
    /// The install plan key this entry came from.
    pub plan_key: PathBuf,
    /// Destination with the scheme placeholder still in place.
    pub destination: String,
    pub kind: FileKind,
    pub tags: BTreeSet<String>,
    pub subproject: Option<String>,
}

/// The result of classifying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile {
    pub entry: InstallPlanEntry,
    pub location: WheelLocation,
    /// Path relative to the location root.
    pub relative_path: PathBuf,
}

/// The fully mapped and validated wheel contents.
#[derive(Debug, Clone)]
pub struct WheelContents {
    /// Sorted by (location, relative path) for reproducibility.
    pub files: Vec<MappedFile>,
    /// No file maps outside purelib.
    pub is_pure: bool,
}

impl WheelContents {
    pub fn has_internal_libs(&self) -> bool {
        self.files
            .iter()
            .any(|file| file.location == WheelLocation::InternalLibs)
    }

    /// The top-level python package and module names, for the editable
    /// loader.
    pub fn top_level_modules(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .filter(|file| {
                matches!(
                    file.location,
                    WheelLocation::Purelib | WheelLocation::Platlib
                )
            })
            .filter_map(|file| {
                let first = file.relative_path.components().next()?;
                let name = first.as_os_str().to_string_lossy();
                // a top-level module contributes its stem
                Some(match name.split_once('.') {
                    Some((stem, _)) => stem.to_string(),
                    None => name.into_owned(),
                })
            })
            .collect()
    }
}

/// The placeholder → location table. `{libdir_static}` is absent on
/// purpose: static libraries are dropped with a warning below.
const PLACEHOLDER_MAP: &[(&str, WheelLocation, &str)] = &[
    ("{py_purelib}", WheelLocation::Purelib, ""),
    ("{py_platlib}", WheelLocation::Platlib, ""),
    ("{moduledir_shared}", WheelLocation::Platlib, ""),
    ("{bindir}", WheelLocation::Scripts, ""),
    ("{includedir}", WheelLocation::Headers, ""),
    ("{libdir_shared}", WheelLocation::InternalLibs, ""),
    ("{datadir}", WheelLocation::Data, "share"),
    ("{mandir}", WheelLocation::Data, "share/man"),
];

/// Filters applied after the initial mapping, extracted from the user's
/// wheel configuration and `meson install` arguments.
#[derive(Debug, Default)]
pub struct PlanFilters {
    exclude: Option<GlobSet>,
    include: Option<GlobSet>,
    /// Retain only entries intersecting these install tags.
    tags: Option<BTreeSet<String>>,
    skip_subprojects: SubprojectFilter,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum SubprojectFilter {
    #[default]
    None,
    All,
    Named(BTreeSet<String>),
}

impl PlanFilters {
    pub fn new(
        wheel_exclude: &[String],
        wheel_include: &[String],
        install_args: &[String],
    ) -> Result<Self> {
        let (tags, skip_subprojects) = parse_install_args(install_args);
        Ok(PlanFilters {
            exclude: build_globset(wheel_exclude, "tool.meson-python.wheel.exclude")?,
            include: build_globset(wheel_include, "tool.meson-python.wheel.include")?,
            tags,
            skip_subprojects,
        })
    }

    /// Excludes are applied first, includes rescue excluded files.
    fn excluded(&self, relative_path: &Path) -> bool {
        let Some(exclude) = &self.exclude else {
            return false;
        };
        if !exclude.is_match(relative_path) {
            return false;
        }
        match &self.include {
            Some(include) => !include.is_match(relative_path),
            None => true,
        }
    }

    fn retained(&self, mapped: &MappedFile) -> bool {
        if self.excluded(&mapped.relative_path) {
            debug!(path = %mapped.relative_path.display(), "excluded from wheel");
            return false;
        }
        self.retained_entry(&mapped.entry)
    }

    /// The tag and subproject filters also apply to entries that could not
    /// be mapped; an entry Meson would not install cannot fail the build.
    fn retained_entry(&self, entry: &InstallPlanEntry) -> bool {
        if let Some(tags) = &self.tags {
            if entry.tags.is_disjoint(tags) {
                return false;
            }
        }
        match &self.skip_subprojects {
            SubprojectFilter::None => true,
            SubprojectFilter::All => entry.subproject.is_none(),
            SubprojectFilter::Named(names) => match &entry.subproject {
                Some(subproject) => !names.contains(subproject),
                None => true,
            },
        }
    }
}

fn build_globset(patterns: &[String], pointer: &str) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .case_insensitive(false)
            .build()
            .map_err(|err| Error::config(pointer, err.to_string()))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|err| Error::config(pointer, err.to_string()))?;
    Ok(Some(set))
}

/// Recognize `--tags` and `--skip-subprojects` in the extra `meson install`
/// arguments so the mapper sees the same subset Meson installs.
fn parse_install_args(args: &[String]) -> (Option<BTreeSet<String>>, SubprojectFilter) {
    let mut tags = None;
    let mut skip = SubprojectFilter::None;
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--tags=") {
            tags = Some(value.split(',').map(str::to_string).collect());
        } else if arg == "--tags" {
            if let Some(value) = iter.next() {
                tags = Some(value.split(',').map(str::to_string).collect());
            }
        } else if let Some(value) = arg.strip_prefix("--skip-subprojects=") {
            skip = SubprojectFilter::Named(value.split(',').map(str::to_string).collect());
        } else if arg == "--skip-subprojects" {
            // a following non-flag argument names the subprojects to skip
            match iter.peek() {
                Some(value) if !value.starts_with('-') => {
                    skip = SubprojectFilter::Named(
                        iter.next()
                            .expect("peeked")
                            .split(',')
                            .map(str::to_string)
                            .collect(),
                    );
                }
                _ => skip = SubprojectFilter::All,
            }
        }
    }
    (tags, skip)
}

/// Classify every install plan entry, apply the filters, and enforce the
/// layout invariants.
///
/// `on_windows` gates internal shared library relocation; `source_dir` and
/// `build_dir` bound where symlinked sources may point.
pub fn map_to_wheel(
    plan: &InstallPlan,
    filters: &PlanFilters,
    source_dir: &Path,
    build_dir: &Path,
    on_windows: bool,
    allow_windows_internal_shared_libs: bool,
) -> Result<WheelContents> {
    let style = style();
    let mut mapped: Vec<MappedFile> = Vec::new();
    let mut unmapped: Vec<InstallPlanEntry> = Vec::new();

    for (group, files) in plan {
        for (source, plan_entry) in files {
            let Some(destination) = plan_entry.destination.as_deref() else {
                continue;
            };
            let source = PathBuf::from(source);

            if destination.starts_with("{libdir_static}") {
                eprintln!(
                    "{}warning{} static library not shipped in the wheel: {}",
                    style.yellow,
                    style.reset,
                    source.display()
                );
                continue;
            }

            for entry in expand_entry(group, &source, destination, plan_entry)? {
                match classify(&entry) {
                    Some(file) => mapped.push(file),
                    None => unmapped.push(entry),
                }
            }
        }
    }

    let mut files: Vec<MappedFile> = mapped
        .into_iter()
        .filter(|file| filters.retained(file))
        .collect();
    files.sort_by(|a, b| {
        (a.location, &a.relative_path).cmp(&(b.location, &b.relative_path))
    });

    // an entry that survived filtering but matched no placeholder is fatal
    if let Some(entry) = unmapped
        .into_iter()
        .find(|entry| filters.retained_entry(entry))
    {
        return Err(Error::UnmappedFile {
            source_path: entry.source,
            destination: entry.destination,
        });
    }

    check_symlinks(&files, source_dir, build_dir)?;
    check_split_packages(&files)?;

    if on_windows
        && !allow_windows_internal_shared_libs
        && files
            .iter()
            .any(|file| file.location == WheelLocation::InternalLibs)
    {
        return Err(Error::WindowsInternalLibForbidden);
    }

    let is_pure = files
        .iter()
        .all(|file| file.location == WheelLocation::Purelib);

    Ok(WheelContents { files, is_pure })
}

/// Expand an `install_subdirs` directory entry into per-file entries;
/// plain files pass through.
fn expand_entry(
    group: &str,
    source: &Path,
    destination: &str,
    plan_entry: &crate::meson::PlanEntry,
) -> Result<Vec<InstallPlanEntry>> {
    let tags: BTreeSet<String> = plan_entry.tag.iter().cloned().collect();

    if source.is_dir() {
        let mut entries = Vec::new();
        for walked in walkdir::WalkDir::new(source)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() || entry.file_type().is_symlink())
        {
            let relative = walked
                .path()
                .strip_prefix(source)
                .expect("walkdir starts with root");
            let destination = format!(
                "{}/{}",
                destination.trim_end_matches('/'),
                relative.to_string_lossy().replace('\\', "/")
            );
            let mut entry = InstallPlanEntry {
                source: walked.path().to_path_buf(),
                plan_key: source.to_path_buf(),
                destination,
                kind: FileKind::Generic,
                tags: tags.clone(),
                subproject: plan_entry.subproject.clone(),
            };
            entry.kind = infer_kind(group, &entry);
            entries.push(entry);
        }
        Ok(entries)
    } else {
        let mut entry = InstallPlanEntry {
            source: source.to_path_buf(),
            plan_key: source.to_path_buf(),
            destination: destination.to_string(),
            kind: FileKind::Generic,
            tags,
            subproject: plan_entry.subproject.clone(),
        };
        entry.kind = infer_kind(group, &entry);
        Ok(vec![entry])
    }
}

/// File kind from the plan group, the destination placeholder, and the
/// file name.
fn infer_kind(group: &str, entry: &InstallPlanEntry) -> FileKind {
    let name = entry
        .source
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    let destination = entry.destination.as_str();

    if destination.starts_with("{includedir}") {
        return FileKind::Header;
    }
    if destination.starts_with("{mandir}") {
        return FileKind::Man;
    }
    if destination.starts_with("{bindir}") {
        return FileKind::Executable;
    }
    if destination.starts_with("{libdir_shared}") || destination.starts_with("{moduledir_shared}")
    {
        return FileKind::SharedLibrary;
    }
    if destination.starts_with("{libdir_static}") {
        return FileKind::StaticLibrary;
    }
    if name.ends_with(".py") {
        return FileKind::PythonSource;
    }
    if group == "targets" {
        if is_native_module_name(&name) {
            return FileKind::ExtensionModule;
        }
        if name.starts_with("lib") || name.ends_with(".dylib") || name.ends_with(".dll") {
            return FileKind::SharedLibrary;
        }
    }
    if destination.starts_with("{datadir}") {
        return FileKind::Data;
    }
    FileKind::Generic
}

/// `foo.cpython-311-x86_64-linux-gnu.so`, `foo.abi3.so`, `foo.cp311-win_amd64.pyd`
fn is_native_module_name(name: &str) -> bool {
    let stripped = name
        .strip_suffix(".so")
        .or_else(|| name.strip_suffix(".pyd"));
    match stripped {
        Some(stem) => stem.contains('.'),
        None => false,
    }
}

fn classify(entry: &InstallPlanEntry) -> Option<MappedFile> {
    for (placeholder, location, prefix) in PLACEHOLDER_MAP {
        if let Some(rest) = entry.destination.strip_prefix(placeholder) {
            let rest = rest.trim_start_matches('/');
            let mut relative_path = PathBuf::from(prefix);
            relative_path.push(rest);
            // extension modules belong to platlib no matter what scheme
            // the build put them in
            let location = if entry.kind == FileKind::ExtensionModule
                && *location == WheelLocation::Purelib
            {
                WheelLocation::Platlib
            } else {
                *location
            };
            return Some(MappedFile {
                entry: entry.clone(),
                location,
                relative_path,
            });
        }
    }
    None
}

/// Symlinked sources must resolve within the source or build tree; those
/// that do are later materialized as regular files by the packager.
fn check_symlinks(files: &[MappedFile], source_dir: &Path, build_dir: &Path) -> Result<()> {
    for file in files {
        let source = &file.entry.source;
        let is_symlink = std::fs::symlink_metadata(source)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            continue;
        }
        let target = fs_err::canonicalize(source)?;
        let inside = [source_dir, build_dir].iter().any(|root| {
            fs_err::canonicalize(root)
                .map(|root| target.starts_with(root))
                .unwrap_or(false)
        });
        if !inside {
            return Err(Error::Io(std::io::Error::other(format!(
                "symlink {} points outside the source tree: {}",
                source.display(),
                target.display()
            ))));
        }
    }
    Ok(())
}

/// No top-level package may straddle purelib and platlib; installers place
/// the two schemes in different directories on some systems.
fn check_split_packages(files: &[MappedFile]) -> Result<()> {
    let mut top_level: BTreeMap<String, BTreeSet<WheelLocation>> = BTreeMap::new();
    for file in files {
        if !matches!(
            file.location,
            WheelLocation::Purelib | WheelLocation::Platlib
        ) {
            continue;
        }
        if let Some(first) = file.relative_path.components().next() {
            top_level
                .entry(first.as_os_str().to_string_lossy().into_owned())
                .or_default()
                .insert(file.location);
        }
    }
    for (name, locations) in top_level {
        if locations.len() > 1 {
            return Err(Error::SplitPackage(name));
        }
    }
    Ok(())
}
