//! Driving the external Meson binary.
//!
//! Meson is always an external process invoked over its stable command line
//! protocol; after `setup` the backend reads the JSON introspection files
//! Meson deposits under `meson-info/`. This keeps the backend independent
//! of Meson's internal APIs and lets users point at any Meson they like.

use std::collections::BTreeMap;
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use fs_err as fs;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::MesonArgs;
use crate::errors::{Error, MesonPhase, Result};
use crate::machine_files::MachineFiles;
use crate::util::style;

/// One file in Meson's install plan: where it goes (with the destination
/// still containing the scheme placeholder) and how it is tagged.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanEntry {
    pub destination: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub subproject: Option<String>,
}

/// `meson-info/intro-install_plan.json`: group name (`targets`, `python`,
/// `data`, `headers`, `install_subdirs`, ...) → source path → entry.
pub type InstallPlan = BTreeMap<String, BTreeMap<String, PlanEntry>>;

/// `meson-info/intro-installed.json`: source path → absolute installed
/// path (before --destdir redirection).
pub type InstalledMap = BTreeMap<String, String>;

/// `meson-info/intro-projectinfo.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectInfo {
    pub descriptive_name: String,
    pub version: String,
    #[serde(default)]
    pub subprojects: Vec<SubprojectInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubprojectInfo {
    pub name: String,
}

/// Everything the backend reads back out of a configured build directory.
#[derive(Debug, Clone)]
pub struct Introspection {
    pub install_plan: InstallPlan,
    pub installed: InstalledMap,
    pub project_info: ProjectInfo,
}

/// Handle on the external Meson binary, bound to one source and build
/// directory pair.
#[derive(Debug, Clone)]
pub struct Meson {
    executable: PathBuf,
    source_dir: PathBuf,
    build_dir: PathBuf,
    args: MesonArgs,
}

impl Meson {
    pub fn new(
        executable: PathBuf,
        source_dir: PathBuf,
        build_dir: PathBuf,
        args: MesonArgs,
    ) -> Self {
        Meson {
            executable,
            source_dir,
            build_dir,
            args,
        }
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Whether the build directory already holds a valid Meson
    /// configuration; governs `--reconfigure`.
    pub fn is_configured(&self) -> bool {
        self.build_dir.join("meson-private").join("coredata.dat").is_file()
    }

    /// `meson setup`, passing the machine files and the composed default +
    /// project + per-invocation options. `--wipe` is never issued.
    #[instrument(skip_all)]
    pub fn setup(&self, machine_files: &MachineFiles) -> Result<()> {
        let mut args: Vec<String> = vec![
            "setup".to_string(),
            self.source_dir.display().to_string(),
            self.build_dir.display().to_string(),
            format!("--native-file={}", machine_files.native.display()),
        ];
        if let Some(cross) = &machine_files.cross {
            args.push(format!("--cross-file={}", cross.display()));
        }
        args.push("-Dbuildtype=release".to_string());
        args.push("-Db_ndebug=if-release".to_string());
        if cfg!(windows) {
            args.push("-Db_vscrt=md".to_string());
        }
        if self.is_configured() {
            args.push("--reconfigure".to_string());
        }
        args.extend(self.args.setup.iter().cloned());
        self.run_meson(MesonPhase::Setup, &args, None)
    }

    /// Build, going through ninja directly where possible. On Windows
    /// `meson compile` is used instead so that Meson can activate the MSVC
    /// environment first.
    #[instrument(skip_all)]
    pub fn compile(&self) -> Result<()> {
        if cfg!(windows) {
            let mut args = vec!["compile".to_string()];
            if !self.args.compile.is_empty() {
                args.push(format!("--ninja-args={}", self.args.compile.join(",")));
            }
            self.run_meson(MesonPhase::Compile, &args, Some(&self.build_dir))
        } else {
            let ninja = ninja_executable();
            let mut command = Command::new(&ninja);
            command.args(&self.args.compile).current_dir(&self.build_dir);
            run(command, MesonPhase::Compile)
        }
    }

    /// `meson install` into the staging directory.
    #[instrument(skip_all)]
    pub fn install(&self, destdir: &Path) -> Result<()> {
        let mut args = vec![
            "install".to_string(),
            "--destdir".to_string(),
            destdir.display().to_string(),
            "--no-rebuild".to_string(),
            "--quiet".to_string(),
        ];
        args.extend(self.args.install.iter().cloned());
        self.run_meson(MesonPhase::Install, &args, Some(&self.build_dir))
    }

    /// `meson dist`, producing a gzipped tarball of the version-controlled
    /// sources under `meson-dist/` in the build directory.
    #[instrument(skip_all)]
    pub fn dist(&self) -> Result<()> {
        let mut args = vec![
            "dist".to_string(),
            "--no-tests".to_string(),
            "--allow-dirty".to_string(),
            "--formats".to_string(),
            "gztar".to_string(),
        ];
        args.extend(self.args.dist.iter().cloned());
        self.run_meson(MesonPhase::Dist, &args, Some(&self.build_dir))
    }

    /// Read the introspection JSON out of the configured build directory.
    #[instrument(skip_all)]
    pub fn introspect(&self) -> Result<Introspection> {
        Ok(Introspection {
            install_plan: self.read_info("intro-install_plan")?,
            installed: self.read_info("intro-installed")?,
            project_info: self.read_info("intro-projectinfo")?,
        })
    }

    fn read_info<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.build_dir.join("meson-info").join(format!("{name}.json"));
        let contents = fs::read_to_string(&path).map_err(|err| Error::Meson {
            phase: MesonPhase::Introspect,
            status: "introspection data missing".to_string(),
            stderr: format!("cannot read {}: {err}", path.display()),
        })?;
        serde_json::from_str(&contents).map_err(|err| Error::Meson {
            phase: MesonPhase::Introspect,
            status: "introspection data invalid".to_string(),
            stderr: format!("cannot parse {}: {err}", path.display()),
        })
    }

    fn run_meson(&self, phase: MesonPhase, args: &[String], cwd: Option<&Path>) -> Result<()> {
        let mut command = Command::new(&self.executable);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        run(command, phase)
    }
}

/// The ninja to compile with: the `NINJA` environment variable if it points
/// at a usable binary, `ninja` on PATH otherwise.
pub fn ninja_executable() -> PathBuf {
    if let Some(ninja) = env::var_os("NINJA") {
        let ninja = PathBuf::from(ninja);
        if which::which(&ninja).is_ok() {
            return ninja;
        }
    }
    PathBuf::from("ninja")
}

/// Whether a usable ninja is visible; feeds `get_requires_for_build_*`.
pub fn have_ninja() -> bool {
    let ninja = ninja_executable();
    which::which(&ninja).is_ok()
}

/// Run a build tool, echoing the command line. Output is streamed to the
/// terminal when interactive and captured otherwise; stderr is attached to
/// the error either way it is available.
fn run(mut command: Command, phase: MesonPhase) -> Result<()> {
    let style = style();
    let rendered = render_command(&command);
    eprintln!("{}{}+ {rendered}{}", style.cyan, style.bold, style.reset);
    debug!(command = %rendered, %phase, "running build tool");

    if std::io::stderr().is_terminal() {
        let status = command.status().map_err(|err| Error::Meson {
            phase,
            status: "failed to start".to_string(),
            stderr: format!("failed to spawn `{rendered}`: {err}"),
        })?;
        if !status.success() {
            return Err(Error::Meson {
                phase,
                status: status.to_string(),
                stderr: "see the output above".to_string(),
            });
        }
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = command.output().map_err(|err| Error::Meson {
            phase,
            status: "failed to start".to_string(),
            stderr: format!("failed to spawn `{rendered}`: {err}"),
        })?;
        if !output.status.success() {
            return Err(Error::Meson {
                phase,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
    }
    Ok(())
}

fn render_command(command: &Command) -> String {
    let mut rendered = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
