//! User configuration.
//!
//! Two sources converge into a single immutable [`ProjectConfig`]: the
//! `[tool.meson-python]` table in pyproject.toml and the PEP 517
//! config-settings mapping passed to the build hooks. Unknown keys are
//! rejected with a did-you-mean suggestion instead of being silently
//! ignored.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::metadata::ProjectMetadata;
use crate::util::closest_match;

/// Extra command line arguments for each Meson phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MesonArgs {
    pub setup: Vec<String>,
    pub compile: Vec<String>,
    pub install: Vec<String>,
    pub dist: Vec<String>,
}

impl MesonArgs {
    /// Append another set of arguments; `other` sorts after `self` on the
    /// final command lines.
    fn extend(&mut self, other: MesonArgs) {
        self.setup.extend(other.setup);
        self.compile.extend(other.compile);
        self.install.extend(other.install);
        self.dist.extend(other.dist);
    }
}

/// A value in the PEP 517 config-settings mapping. Front-ends pass either a
/// single string or a list of strings per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    String(String),
    List(Vec<String>),
}

impl ConfigValue {
    fn as_list(&self) -> Vec<String> {
        match self {
            ConfigValue::String(s) => vec![s.clone()],
            ConfigValue::List(list) => list.clone(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

/// The config-settings mapping handed to the build hooks by the front-end.
pub type ConfigSettings = BTreeMap<String, ConfigValue>;

const KNOWN_CONFIG_SETTINGS: &[&str] = &[
    "build-dir",
    "builddir",
    "setup-args",
    "compile-args",
    "install-args",
    "dist-args",
    "editable-verbose",
];

/// Config-settings recognized by the build hooks.
#[derive(Debug, Clone, Default)]
pub struct BuildSettings {
    pub build_dir: Option<PathBuf>,
    pub meson_args: MesonArgs,
    pub editable_verbose: bool,
}

impl BuildSettings {
    /// Validate and extract the recognized config-settings keys.
    pub fn from_config_settings(settings: Option<&ConfigSettings>) -> Result<Self> {
        let Some(settings) = settings else {
            return Ok(BuildSettings::default());
        };

        for key in settings.keys() {
            if !KNOWN_CONFIG_SETTINGS.contains(&key.as_str()) {
                return Err(Error::UnknownConfigSetting {
                    key: key.clone(),
                    suggestion: closest_match(key, KNOWN_CONFIG_SETTINGS.iter().copied()),
                });
            }
        }

        let build_dir = match (settings.get("build-dir"), settings.get("builddir")) {
            (Some(_), Some(_)) => {
                return Err(Error::config(
                    "build-dir",
                    "`build-dir` and its alias `builddir` cannot both be used",
                ));
            }
            (Some(value), None) | (None, Some(value)) => match value.as_list().as_slice() {
                [single] => Some(PathBuf::from(single)),
                _ => {
                    return Err(Error::config(
                        "build-dir",
                        "only one value can be specified",
                    ));
                }
            },
            (None, None) => None,
        };

        let arg_list = |key: &str| -> Vec<String> {
            settings.get(key).map(ConfigValue::as_list).unwrap_or_default()
        };

        Ok(BuildSettings {
            build_dir,
            meson_args: MesonArgs {
                setup: arg_list("setup-args"),
                compile: arg_list("compile-args"),
                install: arg_list("install-args"),
                dist: arg_list("dist-args"),
            },
            // any non-empty value enables verbose editable rebuilds
            editable_verbose: settings
                .get("editable-verbose")
                .map(|value| !value.as_list().concat().is_empty())
                .unwrap_or(false),
        })
    }
}

/// All user inputs, merged and frozen for the duration of one invocation.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// `[project]` metadata; `None` when pyproject.toml has no such table
    /// and name/version fall back to Meson's project info.
    pub metadata: Option<ProjectMetadata>,
    /// Meson arguments from the tool table followed by the per-invocation
    /// config-settings arguments.
    pub meson_args: MesonArgs,
    /// Build against the CPython limited API.
    pub limited_api: bool,
    /// Permit relocating internal shared libraries on Windows.
    pub allow_windows_internal_shared_libs: bool,
    /// Persistent build directory, if the user selected one.
    pub build_dir: Option<PathBuf>,
    /// Stream editable rebuild output to stderr.
    pub editable_verbose: bool,
    /// Glob patterns removing files from the wheel.
    pub wheel_exclude: Vec<String>,
    /// Glob patterns rescuing files removed by `wheel_exclude`.
    pub wheel_include: Vec<String>,
    /// Meson executable override.
    pub meson: Option<PathBuf>,
}

impl ProjectConfig {
    /// Load pyproject.toml from the source tree and merge it with the
    /// per-invocation config-settings.
    pub fn load(source_dir: &Path, config_settings: Option<&ConfigSettings>) -> Result<Self> {
        let settings = BuildSettings::from_config_settings(config_settings)?;
        let contents = fs::read_to_string(source_dir.join("pyproject.toml"))?;
        Self::from_pyproject(&contents, settings)
    }

    fn from_pyproject(contents: &str, settings: BuildSettings) -> Result<Self> {
        let document: toml::Table = toml::from_str(contents)?;

        let metadata = match document.get("project") {
            Some(_) => Some(ProjectMetadata::from_pyproject(&document)?),
            None => None,
        };

        let tool = ToolTable::from_document(&document)?;
        debug!(?tool, "parsed [tool.meson-python]");

        let mut meson_args = tool.args;
        meson_args.extend(settings.meson_args);

        Ok(ProjectConfig {
            metadata,
            meson_args,
            limited_api: tool.limited_api,
            allow_windows_internal_shared_libs: tool.allow_windows_internal_shared_libs,
            build_dir: settings.build_dir,
            editable_verbose: settings.editable_verbose
                || env::var_os("MESONPY_EDITABLE_VERBOSE").is_some_and(|v| !v.is_empty()),
            wheel_exclude: tool.wheel_exclude,
            wheel_include: tool.wheel_include,
            meson: tool.meson,
        })
    }

    /// The Meson executable to drive: the pyproject override, then the
    /// `MESON` environment variable, then `meson` on PATH.
    pub fn meson_executable(&self) -> Result<PathBuf> {
        if let Some(meson) = &self.meson {
            return Ok(meson.clone());
        }
        if let Some(meson) = env::var_os("MESON") {
            return Ok(PathBuf::from(meson));
        }
        which::which("meson").map_err(|_| {
            Error::config(
                "tool.meson-python.meson",
                "could not find the `meson` executable on PATH",
            )
        })
    }
}

/// The `[tool.meson-python]` table.
#[derive(Debug, Default)]
struct ToolTable {
    args: MesonArgs,
    limited_api: bool,
    allow_windows_internal_shared_libs: bool,
    wheel_exclude: Vec<String>,
    wheel_include: Vec<String>,
    meson: Option<PathBuf>,
}

const TOOL_POINTER: &str = "tool.meson-python";

impl ToolTable {
    fn from_document(document: &toml::Table) -> Result<Self> {
        let Some(table) = document
            .get("tool")
            .and_then(|tool| tool.get("meson-python"))
        else {
            return Ok(ToolTable::default());
        };
        let table = expect_table(table, TOOL_POINTER)?;

        let mut tool = ToolTable::default();
        for (key, value) in table {
            let pointer = format!("{TOOL_POINTER}.{key}");
            match key.as_str() {
                "args" => {
                    let args = expect_table(value, &pointer)?;
                    for (phase, value) in args {
                        let pointer = format!("{pointer}.{phase}");
                        let list = string_list(value, &pointer)?;
                        match phase.as_str() {
                            "setup" => tool.args.setup = list,
                            "compile" => tool.args.compile = list,
                            "install" => tool.args.install = list,
                            "dist" => tool.args.dist = list,
                            other => {
                                return Err(unknown_key(
                                    &pointer,
                                    other,
                                    ["setup", "compile", "install", "dist"],
                                ));
                            }
                        }
                    }
                }
                "wheel" => {
                    let wheel = expect_table(value, &pointer)?;
                    for (name, value) in wheel {
                        let pointer = format!("{pointer}.{name}");
                        match name.as_str() {
                            "exclude" => tool.wheel_exclude = string_list(value, &pointer)?,
                            "include" => tool.wheel_include = string_list(value, &pointer)?,
                            other => {
                                return Err(unknown_key(&pointer, other, ["exclude", "include"]));
                            }
                        }
                    }
                }
                "limited-api" => tool.limited_api = expect_bool(value, &pointer)?,
                "allow-windows-internal-shared-libs" => {
                    tool.allow_windows_internal_shared_libs = expect_bool(value, &pointer)?;
                }
                "meson" => tool.meson = Some(PathBuf::from(expect_str(value, &pointer)?)),
                other => {
                    return Err(unknown_key(
                        &pointer,
                        other,
                        [
                            "args",
                            "wheel",
                            "limited-api",
                            "allow-windows-internal-shared-libs",
                            "meson",
                        ],
                    ));
                }
            }
        }
        Ok(tool)
    }
}

fn unknown_key<'a>(
    pointer: &str,
    key: &str,
    known: impl IntoIterator<Item = &'a str>,
) -> Error {
    let message = match closest_match(key, known) {
        Some(suggestion) => format!("unknown key (did you mean `{suggestion}`?)"),
        None => "unknown key".to_string(),
    };
    Error::config(pointer, message)
}

fn expect_table<'a>(value: &'a toml::Value, pointer: &str) -> Result<&'a toml::Table> {
    value
        .as_table()
        .ok_or_else(|| Error::config(pointer, "expected a table"))
}

fn expect_bool(value: &toml::Value, pointer: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::config(pointer, "expected a boolean"))
}

fn expect_str<'a>(value: &'a toml::Value, pointer: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::config(pointer, "expected a string"))
}

fn string_list(value: &toml::Value, pointer: &str) -> Result<Vec<String>> {
    let array = value
        .as_array()
        .ok_or_else(|| Error::config(pointer, "expected a list of strings"))?;
    array
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::config(pointer, "expected a list of strings"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse(contents: &str) -> Result<ProjectConfig> {
        ProjectConfig::from_pyproject(contents, BuildSettings::default())
    }

    const BASIC: &str = indoc! {r#"
        [project]
        name = "example"
        version = "1.0.0"

        [tool.meson-python]
        limited-api = true
        meson = "/opt/meson/meson.py"

        [tool.meson-python.args]
        setup = ["-Doption=enabled"]
        dist = ["--formats=gztar"]

        [tool.meson-python.wheel]
        exclude = ["mypkg/tests/**"]
        include = ["mypkg/tests/data/keep.csv"]
    "#};

    #[test]
    fn test_tool_table() {
        let config = parse(BASIC).unwrap();
        assert!(config.limited_api);
        assert_eq!(config.meson_args.setup, vec!["-Doption=enabled"]);
        assert_eq!(config.meson_args.dist, vec!["--formats=gztar"]);
        assert_eq!(config.meson_args.compile, Vec::<String>::new());
        assert_eq!(config.wheel_exclude, vec!["mypkg/tests/**"]);
        assert_eq!(config.wheel_include, vec!["mypkg/tests/data/keep.csv"]);
        assert_eq!(config.meson.as_deref(), Some(Path::new("/opt/meson/meson.py")));
    }

    #[test]
    fn test_unknown_tool_key() {
        let contents = indoc! {r#"
            [project]
            name = "example"
            version = "1.0.0"

            [tool.meson-python]
            limited-apy = true
        "#};
        let err = parse(contents).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("tool.meson-python.limited-apy"), "{rendered}");
        assert!(rendered.contains("limited-api"), "{rendered}");
    }

    #[test]
    fn test_unknown_args_phase() {
        let contents = indoc! {r#"
            [tool.meson-python.args]
            stup = ["-Dfoo=bar"]
        "#};
        let err = parse(contents).unwrap_err();
        assert!(err.to_string().contains("did you mean `setup`?"));
    }

    #[test]
    fn test_config_settings_merge_after_tool_args() {
        let mut settings = ConfigSettings::new();
        settings.insert(
            "setup-args".to_string(),
            ConfigValue::List(vec!["-Dfrom-cli=1".to_string()]),
        );
        let settings = BuildSettings::from_config_settings(Some(&settings)).unwrap();
        let config = ProjectConfig::from_pyproject(BASIC, settings).unwrap();
        assert_eq!(
            config.meson_args.setup,
            vec!["-Doption=enabled", "-Dfrom-cli=1"]
        );
    }

    #[test]
    fn test_unknown_config_setting_suggestion() {
        let mut settings = ConfigSettings::new();
        settings.insert("setup-arg".to_string(), ConfigValue::from("-Dx=1"));
        let err = BuildSettings::from_config_settings(Some(&settings)).unwrap_err();
        match err {
            Error::UnknownConfigSetting { key, suggestion } => {
                assert_eq!(key, "setup-arg");
                assert_eq!(suggestion.as_deref(), Some("setup-args"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_dir_alias() {
        let mut settings = ConfigSettings::new();
        settings.insert("builddir".to_string(), ConfigValue::from("build"));
        let settings = BuildSettings::from_config_settings(Some(&settings)).unwrap();
        assert_eq!(settings.build_dir.as_deref(), Some(Path::new("build")));

        let mut settings = ConfigSettings::new();
        settings.insert("build-dir".to_string(), ConfigValue::from("build"));
        settings.insert("builddir".to_string(), ConfigValue::from("build"));
        assert!(BuildSettings::from_config_settings(Some(&settings)).is_err());
    }

    #[test]
    fn test_build_dir_single_value() {
        let mut settings = ConfigSettings::new();
        settings.insert(
            "build-dir".to_string(),
            ConfigValue::List(vec!["a".to_string(), "b".to_string()]),
        );
        assert!(BuildSettings::from_config_settings(Some(&settings)).is_err());
    }
}
