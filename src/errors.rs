//! The error taxonomy of the build backend.
//!
//! Every failure mode the backend can hit is a variant of [`Error`]; all
//! errors are fatal to the invocation and surface a single user-readable
//! message at the hook boundary. Warnings never travel through this type,
//! they go straight to stderr.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The Meson subprocess phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesonPhase {
    Setup,
    Compile,
    Install,
    Dist,
    Introspect,
}

impl std::fmt::Display for MesonPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            MesonPhase::Setup => "setup",
            MesonPhase::Compile => "compile",
            MesonPhase::Install => "install",
            MesonPhase::Dist => "dist",
            MesonPhase::Introspect => "introspect",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user configuration, reported with a dotted path into the
    /// offending pyproject.toml field.
    #[error("invalid configuration entry `{pointer}`: {message}")]
    Config { pointer: String, message: String },

    /// A config-settings key the backend does not recognize.
    #[error("unknown config setting `{key}`{}", did_you_mean(.suggestion))]
    UnknownConfigSetting {
        key: String,
        suggestion: Option<String>,
    },

    /// The interpreter the backend was pointed at is not in the recognized
    /// set (CPython, PyPy).
    #[error("unsupported Python interpreter: {0}")]
    UnsupportedInterpreter(String),

    /// `ARCHFLAGS` and `_PYTHON_HOST_PLATFORM` disagree about the build
    /// target.
    #[error(
        "conflicting cross-compilation configuration: ARCHFLAGS requests `{archflags}` \
         but _PYTHON_HOST_PLATFORM is `{host_platform}`"
    )]
    ConflictingCrossConfig {
        archflags: String,
        host_platform: String,
    },

    /// A Meson subprocess exited unsuccessfully.
    #[error("meson {phase} failed ({status}):\n{stderr}")]
    Meson {
        phase: MesonPhase,
        /// Rendered exit status ("exit status: 1"), or how spawning failed.
        status: String,
        stderr: String,
    },

    /// An install plan entry survived filtering but maps to no wheel
    /// location.
    #[error("file could not be mapped to a wheel location: {} ({destination})", .source_path.display())]
    UnmappedFile {
        source_path: PathBuf,
        destination: String,
    },

    /// The same top-level Python package has files in both purelib and
    /// platlib.
    #[error(
        "the `{0}` package is split between purelib and platlib; \
         install all of its files to the same location"
    )]
    SplitPackage(String),

    /// Internal shared libraries on Windows without the package opting in.
    #[error(
        "relocating internal shared libraries is not supported on Windows unless the \
         package sets `tool.meson-python.allow-windows-internal-shared-libs` and extends \
         the DLL search path at runtime"
    )]
    WindowsInternalLibForbidden,

    /// Adjusting the dynamic-linker search path of a native artifact
    /// failed.
    #[error("failed to rewrite `{}`: {reason}", .path.display())]
    Rewrite { path: PathBuf, reason: String },

    /// Metadata assembly or validation failed.
    #[error("invalid project metadata: {0}")]
    Metadata(String),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(suggestion) => format!(" (did you mean `{suggestion}`?)"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn config(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            pointer: pointer.into(),
            message: message.into(),
        }
    }

    pub(crate) fn rewrite(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Rewrite {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn metadata(message: impl Into<String>) -> Self {
        Error::Metadata(message.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::config("pyproject.toml", err.message().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(err) => Error::Io(err),
            other => Error::Io(io::Error::other(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_config_setting_rendering() {
        let err = Error::UnknownConfigSetting {
            key: "setup-arg".to_string(),
            suggestion: Some("setup-args".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "unknown config setting `setup-arg` (did you mean `setup-args`?)"
        );

        let err = Error::UnknownConfigSetting {
            key: "frobnicate".to_string(),
            suggestion: None,
        };
        assert_eq!(err.to_string(), "unknown config setting `frobnicate`");
    }

    #[test]
    fn test_split_package_rendering() {
        let err = Error::SplitPackage("mypkg".to_string());
        assert!(err.to_string().contains("`mypkg`"));
    }
}
