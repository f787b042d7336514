//! The build pipeline.
//!
//! [`Project`] ties together the configuration, the interpreter, and the
//! Meson driver, and owns the working directories for one invocation. A
//! wheel build runs setup, compile, install, introspect, map, rewrite,
//! package, strictly in order; each step observes the completed state of
//! all prior ones. Everything is synchronous; parallelism lives inside the
//! ninja child process.

use std::path::{Component, Path, PathBuf};

use fs_err as fs;
use itertools::Itertools;
use tracing::{debug, instrument};

use crate::config::{ConfigSettings, ProjectConfig};
use crate::editable;
use crate::errors::{Error, Result};
use crate::install_plan::{
    map_to_wheel, FileKind, MappedFile, PlanFilters, WheelContents, WheelLocation,
};
use crate::interpreter::{
    resolve_tag, select_module_tag, ModuleTag, PythonInterpreter, ResolvedPlatform, WheelTag,
};
use crate::machine_files::{write_machine_files, MachineFiles};
use crate::meson::{ninja_executable, Introspection, Meson};
use crate::rewriter::{is_elf, is_macho, BinaryFormat, Rewriter};
use crate::sdist::rewrite_meson_dist;
use crate::util::{escape_distribution_name, record_hash, style};
use crate::wheel::{is_executable, WheelWriter};

/// A configured Meson project, ready to produce artifacts.
///
/// Construction runs `meson setup` (reconfiguring an existing build
/// directory) and reads the introspection data; the artifact methods run
/// the remaining phases. The temporary working directory lives exactly as
/// long as this value.
pub struct Project {
    config: ProjectConfig,
    interpreter: PythonInterpreter,
    platform: ResolvedPlatform,
    meson: Meson,
    introspection: Introspection,
    source_dir: PathBuf,
    staging_dir: PathBuf,
    rewrite_dir: PathBuf,
    // dropped last, removing the scoped staging/build directories
    _working_dir: tempfile::TempDir,
}

impl Project {
    /// Configure the project in `source_dir` with the given
    /// config-settings.
    pub fn new(source_dir: &Path, config_settings: Option<&ConfigSettings>) -> Result<Self> {
        Self::configure(source_dir, config_settings, false)
    }

    /// Configure for an editable build. Without an explicit `build-dir`
    /// the build directory is placed under the source tree, where it
    /// outlives this invocation; the loader baked into the wheel has to
    /// find it on every import.
    pub fn new_editable(
        source_dir: &Path,
        config_settings: Option<&ConfigSettings>,
    ) -> Result<Self> {
        Self::configure(source_dir, config_settings, true)
    }

    #[instrument(skip_all, fields(source_dir = %source_dir.display()))]
    fn configure(
        source_dir: &Path,
        config_settings: Option<&ConfigSettings>,
        editable: bool,
    ) -> Result<Self> {
        let source_dir = fs::canonicalize(source_dir)?;
        let config = ProjectConfig::load(&source_dir, config_settings)?;
        let interpreter = PythonInterpreter::find()?;
        let platform = crate::interpreter::resolve_platform_tag(&interpreter)?;

        let working_dir = tempfile::Builder::new().prefix("mesonpy-").tempdir()?;
        let build_dir = match &config.build_dir {
            Some(build_dir) => {
                fs::create_dir_all(build_dir)?;
                fs::canonicalize(build_dir)?
            }
            None if editable => {
                let build_dir = source_dir.join(".mesonpy").join("build");
                fs::create_dir_all(&build_dir)?;
                build_dir
            }
            None => {
                let build_dir = working_dir.path().join("build");
                fs::create_dir_all(&build_dir)?;
                build_dir
            }
        };
        let staging_dir = working_dir.path().join("install");
        let rewrite_dir = working_dir.path().join("rewrite");

        let machine_files: MachineFiles =
            write_machine_files(&interpreter, platform.cross.then_some(&platform), &build_dir)?;

        let mut meson_args = config.meson_args.clone();
        if config.limited_api {
            // have Meson build extension modules against the stable ABI
            meson_args
                .setup
                .insert(0, "-Dpython.allow_limited_api=true".to_string());
        }

        let meson = Meson::new(
            config.meson_executable()?,
            source_dir.clone(),
            build_dir,
            meson_args,
        );
        meson.setup(&machine_files)?;
        let introspection = meson.introspect()?;

        Ok(Project {
            config,
            interpreter,
            platform,
            meson,
            introspection,
            source_dir,
            staging_dir,
            rewrite_dir,
            _working_dir: working_dir,
        })
    }

    /// The distribution name: the `[project]` name, or Meson's project
    /// name when pyproject.toml declares no metadata.
    pub fn name(&self) -> &str {
        match &self.config.metadata {
            Some(metadata) => &metadata.name,
            None => &self.introspection.project_info.descriptive_name,
        }
    }

    /// The version, honoring `dynamic = ["version"]`.
    pub fn version(&self) -> &str {
        match &self.config.metadata {
            Some(metadata) if !metadata.dynamic_version() => {
                metadata.version().expect("validated at load")
            }
            _ => &self.introspection.project_info.version,
        }
    }

    fn escaped_name(&self) -> String {
        escape_distribution_name(self.name())
    }

    fn dist_name(&self) -> String {
        format!("{}-{}", self.escaped_name(), self.version())
    }

    /// The core metadata file contents (`METADATA` / `PKG-INFO`).
    pub fn metadata_bytes(&self) -> Result<Vec<u8>> {
        match &self.config.metadata {
            Some(metadata) => Ok(metadata
                .core_metadata(self.version(), &self.source_dir)?
                .into_bytes()),
            None => Ok(format!(
                "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
                self.name(),
                self.version()
            )
            .into_bytes()),
        }
    }

    fn entry_points(&self) -> Option<String> {
        self.config
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.entry_points_txt())
    }

    fn map_contents(&self) -> Result<WheelContents> {
        let filters = PlanFilters::new(
            &self.config.wheel_exclude,
            &self.config.wheel_include,
            &self.config.meson_args.install,
        )?;
        map_to_wheel(
            &self.introspection.install_plan,
            &filters,
            &self.source_dir,
            self.meson.build_dir(),
            cfg!(windows),
            self.config.allow_windows_internal_shared_libs,
        )
    }

    /// The wheel tag for the mapped contents: `py3-none-any` for pure
    /// wheels, interpreter/platform specific otherwise. Wheels without
    /// extension modules keep the generic `py3-none` interpreter part even
    /// when platform-dependent.
    fn wheel_tag(&self, contents: &WheelContents) -> Result<WheelTag> {
        if contents.is_pure {
            return Ok(WheelTag::pure());
        }
        let module_paths: Vec<&Path> = contents
            .files
            .iter()
            .filter(|file| file.entry.kind == FileKind::ExtensionModule)
            .map(|file| file.relative_path.as_path())
            .collect();
        if module_paths.is_empty() {
            return Ok(WheelTag {
                python: "py3".to_string(),
                abi: "none".to_string(),
                platform: self.platform.tag.clone(),
                purelib_only: false,
            });
        }

        let selected = select_module_tag(
            module_paths.iter().copied(),
            &self.interpreter,
            self.config.limited_api,
        )?;
        let resolved = resolve_tag(&self.interpreter, self.config.limited_api)?;
        let mut tag = resolved.tag;
        if !self.config.limited_api {
            // the built artifacts prove stable-ABI compatibility even when
            // the project did not request it through the backend
            if let Some(ModuleTag::Stable(number)) = selected {
                tag.abi = format!("abi{number}");
            }
        }
        Ok(tag)
    }

    /// Build a wheel into `output_dir` and return its path.
    #[instrument(skip_all)]
    pub fn build_wheel(&self, output_dir: &Path) -> Result<PathBuf> {
        self.meson.compile()?;
        fs::create_dir_all(&self.staging_dir)?;
        self.meson.install(&self.staging_dir)?;

        let contents = self.map_contents()?;
        let tag = self.wheel_tag(&contents)?;
        let wheel_path = self.assemble_wheel(&contents, &tag, output_dir)?;

        let style = style();
        eprintln!(
            "{}built {}{}",
            style.bold,
            wheel_path.display(),
            style.reset
        );
        Ok(wheel_path)
    }

    /// Build an editable wheel: a `.pth` plus the generated loader module,
    /// wired at the persistent build directory.
    #[instrument(skip_all)]
    pub fn build_editable(&self, output_dir: &Path) -> Result<PathBuf> {
        // compile once so the first import does not pay for a cold build
        self.meson.compile()?;

        let contents = self.map_contents()?;
        let tag = self.wheel_tag(&contents)?;
        let name = self.name().to_string();

        let rebuild_command: Vec<String> = if cfg!(windows) {
            vec![
                self.config.meson_executable()?.display().to_string(),
                "compile".to_string(),
            ]
        } else {
            vec![ninja_executable().display().to_string()]
        };

        let loader = editable::loader_module(
            &name,
            &contents.top_level_modules(),
            self.meson.build_dir(),
            &rebuild_command,
            self.config.editable_verbose,
        );
        let module_name = editable::loader_module_name(&name);

        fs::create_dir_all(output_dir)?;
        let mut writer = WheelWriter::new(output_dir, &name, self.version(), &tag)?;
        writer.add_bytes(
            &format!("{module_name}.pth"),
            editable::pth_contents(&name).as_bytes(),
            false,
        )?;
        writer.add_bytes(&format!("{module_name}.py"), loader.as_bytes(), false)?;
        let wheel_path = writer.finish(&self.metadata_bytes()?, self.entry_points().as_deref())?;

        let style = style();
        eprintln!(
            "{}built editable wheel {}{}",
            style.bold,
            wheel_path.display(),
            style.reset
        );
        Ok(wheel_path)
    }

    /// Build an sdist into `output_dir` and return its path.
    #[instrument(skip_all)]
    pub fn build_sdist(&self, output_dir: &Path) -> Result<PathBuf> {
        self.meson.dist()?;

        let info = &self.introspection.project_info;
        let meson_dist_name = format!("{}-{}", info.descriptive_name, info.version);
        let meson_dist = self
            .meson
            .build_dir()
            .join("meson-dist")
            .join(format!("{meson_dist_name}.tar.gz"));

        let mtime = fs::metadata(self.source_dir.join("pyproject.toml"))?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0);

        fs::create_dir_all(output_dir)?;
        let sdist_path = rewrite_meson_dist(
            &meson_dist,
            &meson_dist_name,
            &self.dist_name(),
            &self.metadata_bytes()?,
            mtime,
            output_dir,
        )?;

        let style = style();
        eprintln!(
            "{}built {}{}",
            style.bold,
            sdist_path.display(),
            style.reset
        );
        Ok(sdist_path)
    }

    /// Write `{dist_name}.dist-info/` into `output_dir` without compiling,
    /// returning the directory name.
    #[instrument(skip_all)]
    pub fn prepare_metadata(&self, output_dir: &Path) -> Result<String> {
        let contents = self.map_contents()?;
        let tag = self.wheel_tag(&contents)?;

        let dist_info_name = format!("{}.dist-info", self.dist_name());
        let dist_info = output_dir.join(&dist_info_name);
        fs::create_dir_all(&dist_info)?;

        let mut record: Vec<(String, String, usize)> = Vec::new();
        let mut write = |name: &str, bytes: &[u8]| -> Result<()> {
            fs::write(dist_info.join(name), bytes)?;
            record.push((
                format!("{dist_info_name}/{name}"),
                record_hash(bytes),
                bytes.len(),
            ));
            Ok(())
        };

        write("METADATA", &self.metadata_bytes()?)?;
        let wheel_info = format!(
            "Wheel-Version: 1.0\n\
             Generator: mesonpy {}\n\
             Root-Is-Purelib: {}\n\
             Tag: {}\n",
            env!("CARGO_PKG_VERSION"),
            tag.purelib_only,
            tag,
        );
        write("WHEEL", wheel_info.as_bytes())?;
        if let Some(entry_points) = self.entry_points() {
            write("entry_points.txt", entry_points.as_bytes())?;
        }

        let record_contents = record
            .iter()
            .map(|(path, hash, size)| format!("{path},{hash},{size}"))
            .chain(std::iter::once(format!("{dist_info_name}/RECORD,,")))
            .join("\n")
            + "\n";
        fs::write(dist_info.join("RECORD"), record_contents)?;

        Ok(dist_info_name)
    }

    /// Assemble the wheel archive from the mapped contents.
    fn assemble_wheel(
        &self,
        contents: &WheelContents,
        tag: &WheelTag,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let root_location = if contents.is_pure {
            WheelLocation::Purelib
        } else {
            WheelLocation::Platlib
        };
        let libs_dir = format!(".{}.mesonpy.libs", self.escaped_name());

        fs::create_dir_all(output_dir)?;
        let mut writer = WheelWriter::new(output_dir, self.name(), self.version(), tag)?;
        let data_dir = writer.data_dir();

        // destination path inside the archive for every mapped file
        let mut entries: Vec<(String, &MappedFile)> = contents
            .files
            .iter()
            .map(|file| (archive_path(file, root_location, &data_dir, &libs_dir), file))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let rewriter = self.rewriter(contents, &entries)?;

        for (dest, file) in entries {
            let origin = self.staged_origin(file)?;
            match file.entry.kind {
                FileKind::Executable if file.location == WheelLocation::Scripts => {
                    let origin = self.maybe_rewrite(&rewriter, &origin, &dest, &libs_dir)?;
                    writer.add_script(&dest, &origin, &self.interpreter)?;
                }
                kind if kind.is_native() => {
                    let origin = self.maybe_rewrite(&rewriter, &origin, &dest, &libs_dir)?;
                    writer.add_file(&dest, &origin, is_executable(&origin))?;
                }
                _ => writer.add_file(&dest, &origin, is_executable(&origin))?,
            }
        }

        writer.finish(&self.metadata_bytes()?, self.entry_points().as_deref())
    }

    /// Set up the binary rewriter when the wheel contains native
    /// artifacts, verifying the external tools before any file is touched.
    fn rewriter(
        &self,
        contents: &WheelContents,
        entries: &[(String, &MappedFile)],
    ) -> Result<Option<(Rewriter, bool)>> {
        let has_native = entries
            .iter()
            .any(|(_, file)| file.entry.kind.is_native());
        if !has_native {
            return Ok(None);
        }
        let format = BinaryFormat::from_system(&self.interpreter.system);
        let rewriter = Rewriter::new(format, self.meson.build_dir());
        rewriter.check_tools()?;
        Ok(Some((rewriter, contents.has_internal_libs())))
    }

    /// Copy a native artifact aside and adjust its runtime search paths.
    /// The staged copy under the scoped working directory is never the
    /// Meson build output, so editing it cannot invalidate Meson's caches.
    fn maybe_rewrite(
        &self,
        rewriter: &Option<(Rewriter, bool)>,
        origin: &Path,
        dest: &str,
        libs_dir: &str,
    ) -> Result<PathBuf> {
        let Some((rewriter, has_libs)) = rewriter else {
            return Ok(origin.to_path_buf());
        };
        if !is_elf(origin)? && !is_macho(origin)? {
            return Ok(origin.to_path_buf());
        }

        let copy = self.rewrite_dir.join(dest);
        if let Some(parent) = copy.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(origin, &copy)?;
        make_writable(&copy)?;

        let libs_rpath = has_libs.then(|| {
            let parent = Path::new(dest).parent().unwrap_or(Path::new(""));
            relative_path(parent, Path::new(libs_dir))
                .to_string_lossy()
                .into_owned()
        });
        rewriter.fix_rpath(&copy, libs_rpath.as_deref())?;
        Ok(copy)
    }

    /// Where `meson install --destdir` staged the given plan entry.
    fn staged_origin(&self, file: &MappedFile) -> Result<PathBuf> {
        let entry = &file.entry;
        let lookup = |path: &Path| -> Option<PathBuf> {
            let installed = self
                .introspection
                .installed
                .get(path.to_string_lossy().as_ref())?;
            Some(apply_destdir(&self.staging_dir, Path::new(installed)))
        };

        if let Some(staged) = lookup(&entry.source) {
            return Ok(staged);
        }
        // files expanded out of an installed directory: the plan names the
        // directory, the staged location follows the relative position
        if entry.plan_key != entry.source {
            if let Some(staged_dir) = lookup(&entry.plan_key) {
                let relative = entry
                    .source
                    .strip_prefix(&entry.plan_key)
                    .map_err(|_| Error::Io(std::io::Error::other("inconsistent install plan")))?;
                return Ok(staged_dir.join(relative));
            }
        }
        debug!(source = %entry.source.display(), "not in installed map, reading from tree");
        Ok(entry.source.clone())
    }
}

/// Redirect an absolute install path under the staging directory, the way
/// `--destdir` does.
fn apply_destdir(staging: &Path, installed: &Path) -> PathBuf {
    let mut staged = staging.to_path_buf();
    for component in installed.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {}
            other => staged.push(other),
        }
    }
    staged
}

/// The path of a mapped file inside the wheel archive.
fn archive_path(
    file: &MappedFile,
    root_location: WheelLocation,
    data_dir: &str,
    libs_dir: &str,
) -> String {
    let relative = file.relative_path.to_string_lossy().replace('\\', "/");
    match file.location {
        WheelLocation::InternalLibs => format!("{libs_dir}/{relative}"),
        location if location == root_location => relative,
        WheelLocation::Purelib => format!("{data_dir}/purelib/{relative}"),
        WheelLocation::Platlib => format!("{data_dir}/platlib/{relative}"),
        location => {
            let scheme = location.data_scheme().expect("root locations handled above");
            format!("{data_dir}/{scheme}/{relative}")
        }
    }
}

/// Relative path between two directories expressed relative to a common
/// root, `../` style. Pure path computation, no filesystem access.
fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(&to_components)
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..from.len() {
        relative.push("..");
    }
    for component in &to_components[common..] {
        relative.push(component);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

fn make_writable(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    use crate::install_plan::InstallPlanEntry;

    fn mapped(location: WheelLocation, relative: &str, kind: FileKind) -> MappedFile {
        MappedFile {
            entry: InstallPlanEntry {
                source: PathBuf::from("/build/x"),
                plan_key: PathBuf::from("/build/x"),
                destination: String::new(),
                kind,
                tags: BTreeSet::new(),
                subproject: None,
            },
            location,
            relative_path: PathBuf::from(relative),
        }
    }

    #[test]
    fn test_archive_path() {
        let data_dir = "example-1.0.0.data";
        let libs_dir = ".example.mesonpy.libs";

        let file = mapped(WheelLocation::Platlib, "mypkg/ext.so", FileKind::ExtensionModule);
        assert_eq!(
            archive_path(&file, WheelLocation::Platlib, data_dir, libs_dir),
            "mypkg/ext.so"
        );

        let file = mapped(WheelLocation::Scripts, "tool", FileKind::Executable);
        assert_eq!(
            archive_path(&file, WheelLocation::Platlib, data_dir, libs_dir),
            "example-1.0.0.data/scripts/tool"
        );

        let file = mapped(WheelLocation::InternalLibs, "libfoo.so", FileKind::SharedLibrary);
        assert_eq!(
            archive_path(&file, WheelLocation::Platlib, data_dir, libs_dir),
            ".example.mesonpy.libs/libfoo.so"
        );

        // the non-root python scheme lands under the data dir
        let file = mapped(WheelLocation::Purelib, "purepkg/__init__.py", FileKind::PythonSource);
        assert_eq!(
            archive_path(&file, WheelLocation::Platlib, data_dir, libs_dir),
            "example-1.0.0.data/purelib/purepkg/__init__.py"
        );
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("mypkg"), Path::new(".example.mesonpy.libs")),
            PathBuf::from("../.example.mesonpy.libs")
        );
        assert_eq!(
            relative_path(
                Path::new("example-1.0.0.data/scripts"),
                Path::new(".example.mesonpy.libs")
            ),
            PathBuf::from("../../.example.mesonpy.libs")
        );
        assert_eq!(
            relative_path(Path::new(".example.mesonpy.libs"), Path::new(".example.mesonpy.libs")),
            PathBuf::from(".")
        );
        assert_eq!(
            relative_path(Path::new(""), Path::new(".example.mesonpy.libs")),
            PathBuf::from(".example.mesonpy.libs")
        );
    }

    #[test]
    fn test_apply_destdir() {
        assert_eq!(
            apply_destdir(
                Path::new("/tmp/staging"),
                Path::new("/usr/lib/python3.11/site-packages/mypkg/__init__.py")
            ),
            PathBuf::from("/tmp/staging/usr/lib/python3.11/site-packages/mypkg/__init__.py")
        );
    }
}
