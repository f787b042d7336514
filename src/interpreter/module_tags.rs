//! ABI tags of built extension modules.
//!
//! Extension module file names carry the ABI they were compiled for
//! (`foo.cpython-311-x86_64-linux-gnu.so`, `foo.abi3.so`,
//! `foo.cp311-win_amd64.pyd`). Before tagging the wheel the backend checks
//! that every extension agrees: files built for different interpreters in
//! one wheel would import on at most one of them, and a wheel advertising
//! `abi3` must not smuggle in a version-specific module.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{Error, Result};
use crate::interpreter::{InterpreterKind, PythonInterpreter};

/// The ABI a native module file name declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleTag {
    /// PEP 3149 stable ABI, e.g. `abi3`.
    Stable(u32),
    /// Interpreter-specific, e.g. `cpython-311` or `pypy310-pp73`.
    Versioned {
        implementation: String,
        version: String,
    },
}

impl std::fmt::Display for ModuleTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleTag::Stable(number) => write!(f, "abi{number}"),
            ModuleTag::Versioned {
                implementation,
                version,
            } => write!(f, "{implementation}-{version}"),
        }
    }
}

fn native_module_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(?P<name>.+)\.(?P<tag>.+)\.(?:so|pyd)$").unwrap())
}

fn stable_tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^abi(?P<number>[0-9]+)$").unwrap())
}

/// Parse the ABI tag out of a native module file name, `None` when the
/// name carries no tag (plain `foo.so` loadable by anything).
pub fn parse_module_tag(file_name: &str) -> Option<ModuleTag> {
    let captures = native_module_regex().captures(file_name)?;
    let tag = captures.name("tag")?.as_str();

    if let Some(stable) = stable_tag_regex().captures(tag) {
        let number = stable.name("number")?.as_str().parse().ok()?;
        return Some(ModuleTag::Stable(number));
    }

    // cpython-311-x86_64-linux-gnu, pypy310-pp73-..., cp311-win_amd64
    let mut parts = tag.split('-');
    let implementation = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    Some(ModuleTag::Versioned {
        implementation,
        version,
    })
}

/// Check that the extension modules destined for the wheel agree on one
/// ABI and that it matches the interpreter and the limited-API selection.
///
/// Returns the selected tag; `None` when the wheel ships no tagged
/// extension modules.
pub fn select_module_tag<'a>(
    module_paths: impl Iterator<Item = &'a Path>,
    interpreter: &PythonInterpreter,
    limited_api: bool,
) -> Result<Option<ModuleTag>> {
    let mut selected: Option<(ModuleTag, &'a Path)> = None;

    for path in module_paths {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(tag) = parse_module_tag(file_name) else {
            continue;
        };

        if let ModuleTag::Versioned { implementation, .. } = &tag {
            let module_kind = if implementation.starts_with("pypy") || implementation == "pp" {
                Some(InterpreterKind::PyPy)
            } else if implementation.starts_with("cp") {
                Some(InterpreterKind::CPython)
            } else {
                None
            };
            if module_kind != Some(interpreter.kind) {
                return Err(Error::metadata(format!(
                    "extension module {} was built for {}, not for the {} interpreter \
                     the wheel targets",
                    file_name, implementation, interpreter.kind,
                )));
            }
        }

        selected = match selected {
            None => Some((tag, path)),
            Some((previous, previous_path)) => match (&previous, &tag) {
                // mixing stable-ABI and version-specific modules is fine,
                // the wheel takes the more specific tag
                (ModuleTag::Stable(_), ModuleTag::Versioned { .. }) => Some((tag, path)),
                (ModuleTag::Versioned { .. }, ModuleTag::Stable(_)) => {
                    Some((previous, previous_path))
                }
                (a, b) if a == b => Some((previous, previous_path)),
                _ => {
                    return Err(Error::metadata(format!(
                        "extension modules with incompatible ABI tags: {} ({previous}) and \
                         {} ({tag})",
                        previous_path.display(),
                        path.display(),
                    )));
                }
            },
        };
    }

    let selected = selected.map(|(tag, _)| tag);

    if limited_api && interpreter.has_stable_api() {
        if let Some(ModuleTag::Versioned { .. }) = &selected {
            return Err(Error::metadata(
                "limited-api is enabled but the build produced version-specific \
                 extension modules; make sure the project honors the \
                 `python.allow_limited_api` option"
                    .to_string(),
            ));
        }
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn interpreter() -> PythonInterpreter {
        crate::interpreter::tests::linux_cpython()
    }

    #[test]
    fn test_parse_module_tag() {
        assert_eq!(
            parse_module_tag("foo.cpython-311-x86_64-linux-gnu.so"),
            Some(ModuleTag::Versioned {
                implementation: "cpython".to_string(),
                version: "311".to_string(),
            })
        );
        assert_eq!(parse_module_tag("foo.abi3.so"), Some(ModuleTag::Stable(3)));
        assert_eq!(
            parse_module_tag("foo.cp311-win_amd64.pyd"),
            Some(ModuleTag::Versioned {
                implementation: "cp311".to_string(),
                version: "win_amd64".to_string(),
            })
        );
        assert_eq!(parse_module_tag("libfoo.so"), None);
        assert_eq!(parse_module_tag("data.txt"), None);
    }

    #[test]
    fn test_select_single_tag() {
        let paths = [Path::new("mypkg/_a.cpython-311-x86_64-linux-gnu.so")];
        let tag = select_module_tag(paths.iter().copied(), &interpreter(), false).unwrap();
        assert_eq!(
            tag,
            Some(ModuleTag::Versioned {
                implementation: "cpython".to_string(),
                version: "311".to_string(),
            })
        );
    }

    #[test]
    fn test_untagged_modules_select_nothing() {
        let paths = [Path::new("mypkg/libhelper.so")];
        let tag = select_module_tag(paths.iter().copied(), &interpreter(), false).unwrap();
        assert_eq!(tag, None);
    }

    #[test]
    fn test_versioned_wins_over_stable() {
        let paths = [
            Path::new("mypkg/_a.abi3.so"),
            Path::new("mypkg/_b.cpython-311-x86_64-linux-gnu.so"),
        ];
        let tag = select_module_tag(paths.iter().copied(), &interpreter(), false).unwrap();
        assert!(matches!(tag, Some(ModuleTag::Versioned { .. })));

        // order does not matter
        let paths = [
            Path::new("mypkg/_b.cpython-311-x86_64-linux-gnu.so"),
            Path::new("mypkg/_a.abi3.so"),
        ];
        let tag = select_module_tag(paths.iter().copied(), &interpreter(), false).unwrap();
        assert!(matches!(tag, Some(ModuleTag::Versioned { .. })));
    }

    #[test]
    fn test_incompatible_versions_fail() {
        let paths = [
            Path::new("mypkg/_a.cpython-310-x86_64-linux-gnu.so"),
            Path::new("mypkg/_b.cpython-311-x86_64-linux-gnu.so"),
        ];
        let err =
            select_module_tag(paths.iter().copied(), &interpreter(), false).unwrap_err();
        assert!(err.to_string().contains("incompatible ABI tags"));
    }

    #[test]
    fn test_limited_api_mismatch_fails() {
        let paths = [Path::new("mypkg/_a.cpython-311-x86_64-linux-gnu.so")];
        let err = select_module_tag(paths.iter().copied(), &interpreter(), true).unwrap_err();
        assert!(err.to_string().contains("limited-api"));
    }

    #[test]
    fn test_limited_api_with_stable_modules() {
        let paths = [Path::new("mypkg/_a.abi3.so")];
        let tag = select_module_tag(paths.iter().copied(), &interpreter(), true).unwrap();
        assert_eq!(tag, Some(ModuleTag::Stable(3)));
    }
}
