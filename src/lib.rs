//! Meson build system backend for Python packaging.
//!
//! Given a source tree with a `meson.build` and a `pyproject.toml`, this
//! crate drives an external Meson binary through `setup`, `compile`, and
//! `install`, classifies every file Meson would install into the wheel
//! layout, rewrites native binaries so intra-wheel library references
//! survive relocation, and packs the result into standardized artifacts:
//! wheels, source distributions, and editable wheels whose loader rebuilds
//! the project on import.
//!
//! The functions at the crate root mirror the PEP 517 hook contract;
//! front-ends (or thin shims around this library) call them with the
//! source tree as the current directory. The [`Project`] type underneath
//! exposes the same pipeline for callers that want more control.
//!
//! The backend is single-threaded and synchronous; parallelism happens
//! inside the ninja child process. Concurrent invocations against the same
//! build directory are unsupported.

mod config;
mod editable;
mod errors;
mod install_plan;
mod interpreter;
mod machine_files;
mod meson;
mod metadata;
mod project;
mod rewriter;
mod sdist;
mod util;
mod wheel;

use std::path::Path;

pub use crate::config::{BuildSettings, ConfigSettings, ConfigValue, MesonArgs, ProjectConfig};
pub use crate::errors::{Error, MesonPhase, Result};
pub use crate::install_plan::{
    FileKind, InstallPlanEntry, MappedFile, WheelContents, WheelLocation,
};
pub use crate::interpreter::{InterpreterConfig, InterpreterKind, PythonInterpreter, WheelTag};
pub use crate::metadata::ProjectMetadata;
pub use crate::project::Project;

/// Build a wheel for the project in the current directory, placing it in
/// `output_dir`. Returns the wheel filename.
pub fn build_wheel(
    output_dir: &Path,
    config_settings: Option<&ConfigSettings>,
    _metadata_dir: Option<&Path>,
) -> Result<String> {
    let project = Project::new(Path::new("."), config_settings)?;
    let wheel = project.build_wheel(output_dir)?;
    Ok(file_name(&wheel))
}

/// Build a source distribution for the project in the current directory.
/// Returns the sdist filename.
pub fn build_sdist(output_dir: &Path, config_settings: Option<&ConfigSettings>) -> Result<String> {
    let project = Project::new(Path::new("."), config_settings)?;
    let sdist = project.build_sdist(output_dir)?;
    Ok(file_name(&sdist))
}

/// Build an editable wheel: the installed package imports from the source
/// tree and rebuilds native modules on demand. Requires a persistent
/// `build-dir` config setting to be useful across installs.
pub fn build_editable(
    output_dir: &Path,
    config_settings: Option<&ConfigSettings>,
    _metadata_dir: Option<&Path>,
) -> Result<String> {
    let project = Project::new_editable(Path::new("."), config_settings)?;
    let wheel = project.build_editable(output_dir)?;
    Ok(file_name(&wheel))
}

/// Write the `.dist-info` directory for the project in the current
/// directory without compiling anything. Returns the directory name.
pub fn prepare_metadata_for_build_wheel(
    output_dir: &Path,
    config_settings: Option<&ConfigSettings>,
) -> Result<String> {
    let project = Project::new(Path::new("."), config_settings)?;
    project.prepare_metadata(output_dir)
}

/// The extra build requirements for a wheel build: ninja when no usable
/// ninja is on PATH, patchelf on Linux when absent.
pub fn get_requires_for_build_wheel(
    _config_settings: Option<&ConfigSettings>,
) -> Vec<String> {
    let mut requires = Vec::new();
    if !crate::meson::have_ninja() {
        requires.push("ninja >= 1.8.2".to_string());
    }
    if cfg!(target_os = "linux") && which::which("patchelf").is_err() {
        requires.push("patchelf >= 0.11.0".to_string());
    }
    requires
}

/// Editable builds need the same tools as regular wheel builds.
pub fn get_requires_for_build_editable(
    config_settings: Option<&ConfigSettings>,
) -> Vec<String> {
    get_requires_for_build_wheel(config_settings)
}

/// Sdists only need Meson itself.
pub fn get_requires_for_build_sdist(
    _config_settings: Option<&ConfigSettings>,
) -> Vec<String> {
    Vec::new()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
