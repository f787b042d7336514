//! Python interpreter introspection and wheel tag resolution.
//!
//! The backend needs to know, for the interpreter the wheel is built
//! against: its implementation and version (python tag), its ABI (abi tag),
//! and the platform it runs on (platform tag). All of it comes from a small
//! introspection snippet executed in the interpreter, which prints its
//! sysconfig view as JSON.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{Error, Result};

mod module_tags;
mod platform_tag;

pub(crate) use module_tags::{select_module_tag, ModuleTag};
pub(crate) use platform_tag::{resolve_platform_tag, ResolvedPlatform};

/// This snippet prints the interpreter's version, ABI, and sysconfig
/// layout as json on stdout.
const GET_INTERPRETER_METADATA: &str = include_str!("get_interpreter_metadata.py");

/// The recognized Python implementations.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum InterpreterKind {
    CPython,
    PyPy,
}

impl InterpreterKind {
    pub fn is_cpython(&self) -> bool {
        matches!(self, InterpreterKind::CPython)
    }

    pub fn is_pypy(&self) -> bool {
        matches!(self, InterpreterKind::PyPy)
    }
}

impl fmt::Display for InterpreterKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            InterpreterKind::CPython => write!(f, "CPython"),
            InterpreterKind::PyPy => write!(f, "PyPy"),
        }
    }
}

impl FromStr for InterpreterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpython" => Ok(InterpreterKind::CPython),
            "pypy" => Ok(InterpreterKind::PyPy),
            unknown => Err(format!("unknown interpreter kind '{unknown}'")),
        }
    }
}

/// The output format of [GET_INTERPRETER_METADATA].
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterConfig {
    pub implementation_name: String,
    pub executable: String,
    pub major: usize,
    pub minor: usize,
    pub abiflags: String,
    pub ext_suffix: Option<String>,
    pub soabi: Option<String>,
    /// Comes from `sysconfig.get_platform()`.
    pub platform: String,
    /// Comes from `platform.system()`, lowercased.
    pub system: String,
    pub pointer_width: usize,
    pub gil_disabled: bool,
    pub base_prefix: String,
    pub purelib: String,
    pub platlib: String,
}

/// A Python interpreter the backend introspected.
#[derive(Debug, Clone)]
pub struct PythonInterpreter {
    pub config: InterpreterConfig,
    pub kind: InterpreterKind,
    /// Path the interpreter was invoked as.
    pub executable: PathBuf,
}

impl std::ops::Deref for PythonInterpreter {
    type Target = InterpreterConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl PythonInterpreter {
    /// Locate the interpreter the build targets: the `MESONPY_PYTHON`
    /// environment variable if set, otherwise `python3` then `python` on
    /// PATH.
    pub fn find() -> Result<Self> {
        if let Some(python) = env::var_os("MESONPY_PYTHON") {
            return Self::introspect(Path::new(&python));
        }
        let executable = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| {
                Error::UnsupportedInterpreter(
                    "no python interpreter found on PATH (set MESONPY_PYTHON to override)"
                        .to_string(),
                )
            })?;
        Self::introspect(&executable)
    }

    /// Run the introspection snippet in the given interpreter and check the
    /// result against the recognized implementation set.
    pub fn introspect(executable: &Path) -> Result<Self> {
        let output = Command::new(executable)
            .env("PYTHONNOUSERSITE", "1")
            .args(["-c", GET_INTERPRETER_METADATA])
            .output()
            .map_err(|err| {
                Error::UnsupportedInterpreter(format!(
                    "failed to run `{}`: {err}",
                    executable.display()
                ))
            })?;
        if !output.status.success() {
            return Err(Error::UnsupportedInterpreter(format!(
                "`{}` exited with {}: {}",
                executable.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        let config: InterpreterConfig = serde_json::from_slice(&output.stdout)?;
        debug!(?config, "introspected python interpreter");
        Self::from_config(config, executable.to_path_buf())
    }

    fn from_config(config: InterpreterConfig, executable: PathBuf) -> Result<Self> {
        let kind = config
            .implementation_name
            .parse::<InterpreterKind>()
            .map_err(Error::UnsupportedInterpreter)?;
        if config.major != 3 {
            return Err(Error::UnsupportedInterpreter(format!(
                "python {}.{} is not supported, only python 3 is",
                config.major, config.minor
            )));
        }
        Ok(PythonInterpreter {
            config,
            kind,
            executable,
        })
    }

    /// The python tag for the wheel filename, e.g. `cp311` or `pp310`.
    pub fn python_tag(&self) -> String {
        let prefix = match self.kind {
            InterpreterKind::CPython => "cp",
            InterpreterKind::PyPy => "pp",
        };
        format!("{prefix}{}{}", self.major, self.minor)
    }

    /// The ABI tag of a regular (non limited-API) wheel.
    ///
    /// Derived from `EXT_SUFFIX` where possible, with the abiflags-based
    /// spelling as fallback.
    pub fn abi_tag(&self) -> String {
        self.ext_suffix
            .as_deref()
            .and_then(calculate_abi_tag)
            .unwrap_or_else(|| match self.kind {
                InterpreterKind::CPython => {
                    format!("cp{}{}{}", self.major, self.minor, self.abiflags)
                }
                InterpreterKind::PyPy => format!("pypy{}{}_pp73", self.major, self.minor),
            })
    }

    /// Whether this interpreter can target the CPython limited API.
    ///
    /// Free-threaded CPython does not support the stable ABI yet, and PyPy
    /// never has.
    pub fn has_stable_api(&self) -> bool {
        self.kind.is_cpython() && !self.gil_disabled
    }

    /// The scripts installed into `{bindir}` get their shebang rewritten
    /// when it points at this interpreter (or its base installation).
    pub fn owns_shebang(&self, interpreter_path: &str) -> bool {
        interpreter_path == self.config.executable
            || Path::new(interpreter_path).starts_with(&self.config.base_prefix)
    }
}

impl fmt::Display for PythonInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}{} at {}",
            self.kind,
            self.major,
            self.minor,
            self.abiflags,
            self.executable.display()
        )
    }
}

/// The wheel tag triple plus the purity marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelTag {
    pub python: String,
    pub abi: String,
    pub platform: String,
    pub purelib_only: bool,
}

impl WheelTag {
    /// The tag of a pure, interpreter-independent wheel.
    pub fn pure() -> Self {
        WheelTag {
            python: "py3".to_string(),
            abi: "none".to_string(),
            platform: "any".to_string(),
            purelib_only: true,
        }
    }
}

impl fmt::Display for WheelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.python, self.abi, self.platform)
    }
}

/// The tag resolver's full answer: the tag triple, the limited-API minimum
/// version (when the abi tag is `abi3`), and the cross target requested via
/// `ARCHFLAGS`, if any.
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    pub tag: WheelTag,
    pub abi3_minimum: Option<(usize, usize)>,
    pub cross: Option<ResolvedPlatform>,
}

/// Derive the wheel tag for a platform-dependent wheel built against the
/// given interpreter.
pub fn resolve_tag(interpreter: &PythonInterpreter, limited_api: bool) -> Result<ResolvedTag> {
    let resolved = resolve_platform_tag(interpreter)?;

    let (abi, abi3_minimum) = if limited_api {
        if interpreter.has_stable_api() {
            ("abi3".to_string(), Some((interpreter.major, interpreter.minor)))
        } else {
            // PyPy and free-threaded CPython cannot target the limited API
            eprintln!(
                "warning: {} does not support the limited API, \
                 building a version-specific wheel",
                interpreter.kind
            );
            (interpreter.abi_tag(), None)
        }
    } else {
        (interpreter.abi_tag(), None)
    };

    Ok(ResolvedTag {
        tag: WheelTag {
            python: interpreter.python_tag(),
            abi,
            platform: resolved.tag.clone(),
            purelib_only: false,
        },
        abi3_minimum,
        cross: resolved.cross.then_some(resolved),
    })
}

/// Calculate the ABI tag from EXT_SUFFIX.
///
/// Examples: `.cpython-311-x86_64-linux-gnu.so` → `cp311`,
/// `.cp311-win_amd64.pyd` → `cp311`,
/// `.pypy310-pp73-x86_64-linux-gnu.so` → `pypy310_pp73`.
fn calculate_abi_tag(ext_suffix: &str) -> Option<String> {
    let parts = ext_suffix.split('.').collect::<Vec<_>>();
    if parts.len() < 3 {
        // CPython 3.7 and earlier uses ".pyd" on Windows
        return None;
    }
    let soabi = parts[1];
    let mut soabi_split = soabi.split('-');
    let abi = if soabi.starts_with("cpython") {
        // non-windows
        format!("cp{}", soabi_split.nth(1)?)
    } else if soabi.starts_with("cp") {
        // windows
        soabi_split.next()?.to_string()
    } else if soabi.starts_with("pypy") {
        soabi_split.take(2).collect::<Vec<_>>().join("-")
    } else if !soabi.is_empty() {
        soabi_split.nth(1)?.to_string()
    } else {
        return None;
    };
    Some(abi.replace(['.', '-', ' '], "_"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn linux_cpython() -> PythonInterpreter {
        PythonInterpreter::from_config(
            InterpreterConfig {
                implementation_name: "cpython".to_string(),
                executable: "/usr/bin/python3.11".to_string(),
                major: 3,
                minor: 11,
                abiflags: String::new(),
                ext_suffix: Some(".cpython-311-x86_64-linux-gnu.so".to_string()),
                soabi: Some("cpython-311-x86_64-linux-gnu".to_string()),
                platform: "linux-x86_64".to_string(),
                system: "linux".to_string(),
                pointer_width: 64,
                gil_disabled: false,
                base_prefix: "/usr".to_string(),
                purelib: "/usr/lib/python3.11/site-packages".to_string(),
                platlib: "/usr/lib64/python3.11/site-packages".to_string(),
            },
            PathBuf::from("/usr/bin/python3.11"),
        )
        .unwrap()
    }

    fn pypy() -> PythonInterpreter {
        let mut interpreter = linux_cpython();
        interpreter.kind = InterpreterKind::PyPy;
        interpreter.config.implementation_name = "pypy".to_string();
        interpreter.config.minor = 10;
        interpreter.config.ext_suffix =
            Some(".pypy310-pp73-x86_64-linux-gnu.so".to_string());
        interpreter
    }

    #[test]
    fn test_python_tag() {
        assert_eq!(linux_cpython().python_tag(), "cp311");
        assert_eq!(pypy().python_tag(), "pp310");
    }

    #[test]
    fn test_abi_tag() {
        assert_eq!(linux_cpython().abi_tag(), "cp311");
        assert_eq!(pypy().abi_tag(), "pypy310_pp73");
    }

    #[test]
    fn test_calculate_abi_tag() {
        let cases = vec![
            (".cpython-37m-x86_64-linux-gnu.so", Some("cp37m")),
            (".cpython-310-x86_64-linux-gnu.so", Some("cp310")),
            (".cpython-310-darwin.so", Some("cp310")),
            (".cpython-313t-darwin.so", Some("cp313t")),
            (".cp310-win_amd64.pyd", Some("cp310")),
            (".cpython-38.so", Some("cp38")),
            (".pyd", None),
            (".so", None),
            (".pypy38-pp73-x86_64-linux-gnu.so", Some("pypy38_pp73")),
            (".nodashes.so", None),
        ];
        for (ext_suffix, expected) in cases {
            assert_eq!(calculate_abi_tag(ext_suffix).as_deref(), expected);
        }
    }

    #[test]
    fn test_unrecognized_implementation() {
        let mut config = linux_cpython().config;
        config.implementation_name = "graalpy".to_string();
        let err =
            PythonInterpreter::from_config(config, PathBuf::from("graalpy")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedInterpreter(_)));
    }

    #[test]
    fn test_limited_api_tag() {
        let resolved = resolve_tag(&linux_cpython(), true).unwrap();
        assert_eq!(resolved.tag.abi, "abi3");
        assert_eq!(resolved.abi3_minimum, Some((3, 11)));

        // PyPy falls back to the version-specific ABI
        let resolved = resolve_tag(&pypy(), true).unwrap();
        assert_eq!(resolved.tag.abi, "pypy310_pp73");
        assert_eq!(resolved.abi3_minimum, None);
    }

    #[test]
    fn test_wheel_tag_display() {
        assert_eq!(WheelTag::pure().to_string(), "py3-none-any");
    }

    #[test]
    fn test_shebang_ownership() {
        let interpreter = linux_cpython();
        assert!(interpreter.owns_shebang("/usr/bin/python3.11"));
        assert!(interpreter.owns_shebang("/usr/bin/python3"));
        assert!(!interpreter.owns_shebang("/opt/other/bin/python3"));
    }
}
