//! Project metadata assembly.
//!
//! Parses the `[project]` table of pyproject.toml and renders the core
//! metadata file (`METADATA` in wheels, `PKG-INFO` in sdists) plus
//! `entry_points.txt`. Only the `version` field may be declared dynamic, in
//! which case it is filled in from Meson's project introspection.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use fs_err as fs;
use pep440_rs::{Version, VersionSpecifiers};
use serde::Deserialize;

use crate::errors::{Error, Result};

/// The `[project]` table, PEP 621.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProjectMetadata {
    pub name: String,
    version: Option<String>,
    description: Option<String>,
    readme: Option<Readme>,
    requires_python: Option<String>,
    license: Option<License>,
    license_files: Option<Vec<String>>,
    authors: Option<Vec<Contact>>,
    maintainers: Option<Vec<Contact>>,
    keywords: Option<Vec<String>>,
    classifiers: Option<Vec<String>>,
    urls: Option<BTreeMap<String, String>>,
    dependencies: Option<Vec<String>>,
    optional_dependencies: Option<BTreeMap<String, Vec<String>>>,
    scripts: Option<BTreeMap<String, String>>,
    gui_scripts: Option<BTreeMap<String, String>>,
    entry_points: Option<BTreeMap<String, BTreeMap<String, String>>>,
    #[serde(default)]
    dynamic: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Readme {
    Path(String),
    Table {
        file: Option<String>,
        text: Option<String>,
        #[serde(rename = "content-type")]
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum License {
    /// PEP 639 SPDX expression.
    Expression(String),
    /// Legacy table form.
    Table {
        file: Option<String>,
        text: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Contact {
    name: Option<String>,
    email: Option<String>,
}

impl ProjectMetadata {
    /// Parse the `[project]` table out of a full pyproject.toml document.
    pub fn from_pyproject(document: &toml::Table) -> Result<Self> {
        let project = document
            .get("project")
            .ok_or_else(|| Error::metadata("missing [project] table"))?;
        let metadata: ProjectMetadata = project
            .clone()
            .try_into()
            .map_err(|err: toml::de::Error| {
                Error::config("project", err.message().to_string())
            })?;
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<()> {
        for field in &self.dynamic {
            if field != "version" {
                return Err(Error::metadata(format!(
                    "unsupported dynamic field `{field}`; only `version` may be dynamic"
                )));
            }
        }
        match (&self.version, self.dynamic.iter().any(|f| f == "version")) {
            (None, false) => {
                return Err(Error::metadata(
                    "`project.version` is missing and not declared dynamic",
                ));
            }
            (Some(_), true) => {
                return Err(Error::metadata(
                    "`project.version` is both declared and marked dynamic",
                ));
            }
            _ => {}
        }
        if let Some(version) = &self.version {
            Version::from_str(version).map_err(|err| {
                Error::config("project.version", err.to_string())
            })?;
        }
        if let Some(requires_python) = &self.requires_python {
            VersionSpecifiers::from_str(requires_python).map_err(|err| {
                Error::config("project.requires-python", err.to_string())
            })?;
        }
        if let Some(entry_points) = &self.entry_points {
            for group in entry_points.keys() {
                if group == "console_scripts" || group == "gui_scripts" {
                    return Err(Error::metadata(format!(
                        "use `project.scripts` or `project.gui-scripts` instead of \
                         `project.entry-points.{group}`"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The statically declared version, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Whether the version is filled in from Meson project info.
    pub fn dynamic_version(&self) -> bool {
        self.dynamic.iter().any(|field| field == "version")
    }

    /// The version specifiers of `requires-python`, if declared.
    pub fn requires_python(&self) -> Option<VersionSpecifiers> {
        self.requires_python
            .as_deref()
            .and_then(|spec| VersionSpecifiers::from_str(spec).ok())
    }

    /// Console script names; these become wheel entry points, not files.
    pub fn has_entry_points(&self) -> bool {
        self.scripts.is_some() || self.gui_scripts.is_some() || self.entry_points.is_some()
    }

    /// Render `entry_points.txt`, or `None` when no entry points are
    /// declared.
    pub fn entry_points_txt(&self) -> Option<String> {
        if !self.has_entry_points() {
            return None;
        }
        let mut out = String::new();
        let mut write_group = |group: &str, entries: &BTreeMap<String, String>| {
            let _ = writeln!(out, "[{group}]");
            for (name, object_ref) in entries {
                let _ = writeln!(out, "{name} = {object_ref}");
            }
            out.push('\n');
        };
        if let Some(scripts) = &self.scripts {
            write_group("console_scripts", scripts);
        }
        if let Some(gui_scripts) = &self.gui_scripts {
            write_group("gui_scripts", gui_scripts);
        }
        for (group, entries) in self.entry_points.iter().flatten() {
            write_group(group, entries);
        }
        Some(out)
    }

    /// Render the core metadata file for the given resolved version.
    ///
    /// Readme and license file contents are read relative to `source_dir`.
    pub fn core_metadata(&self, version: &str, source_dir: &Path) -> Result<String> {
        // PEP 639 fields bump the metadata version
        let pep639 = matches!(self.license, Some(License::Expression(_)))
            || self.license_files.is_some();
        let metadata_version = if pep639 { "2.4" } else { "2.1" };

        let mut out = String::new();
        let _ = writeln!(out, "Metadata-Version: {metadata_version}");
        let _ = writeln!(out, "Name: {}", self.name);
        let _ = writeln!(out, "Version: {version}");
        if let Some(description) = &self.description {
            let _ = writeln!(out, "Summary: {description}");
        }
        if let Some(keywords) = &self.keywords {
            let _ = writeln!(out, "Keywords: {}", keywords.join(","));
        }
        for (header, contacts) in [
            ("Author", &self.authors),
            ("Maintainer", &self.maintainers),
        ] {
            for contact in contacts.iter().flatten() {
                match (&contact.name, &contact.email) {
                    (Some(name), Some(email)) => {
                        let _ = writeln!(out, "{header}-email: {name} <{email}>");
                    }
                    (None, Some(email)) => {
                        let _ = writeln!(out, "{header}-email: {email}");
                    }
                    (Some(name), None) => {
                        let _ = writeln!(out, "{header}: {name}");
                    }
                    (None, None) => {}
                }
            }
        }
        match &self.license {
            Some(License::Expression(expression)) => {
                let _ = writeln!(out, "License-Expression: {expression}");
            }
            Some(License::Table { file, text }) => {
                if let Some(text) = text {
                    write_folded(&mut out, "License", text);
                } else if let Some(file) = file {
                    let text = fs::read_to_string(source_dir.join(file))?;
                    write_folded(&mut out, "License", text.trim_end());
                }
            }
            None => {}
        }
        for pattern in self.license_files.iter().flatten() {
            for path in expand_license_glob(source_dir, pattern)? {
                let _ = writeln!(out, "License-File: {path}");
            }
        }
        for classifier in self.classifiers.iter().flatten() {
            let _ = writeln!(out, "Classifier: {classifier}");
        }
        if let Some(requires_python) = &self.requires_python {
            let _ = writeln!(out, "Requires-Python: {requires_python}");
        }
        for dep in self.dependencies.iter().flatten() {
            let _ = writeln!(out, "Requires-Dist: {dep}");
        }
        for (extra, deps) in self.optional_dependencies.iter().flatten() {
            let _ = writeln!(out, "Provides-Extra: {extra}");
            for dep in deps {
                let _ = writeln!(out, "Requires-Dist: {dep} ; extra == \"{extra}\"");
            }
        }
        for (label, url) in self.urls.iter().flatten() {
            let _ = writeln!(out, "Project-URL: {label}, {url}");
        }

        if let Some(readme) = &self.readme {
            let (text, content_type) = self.readme_contents(readme, source_dir)?;
            let _ = writeln!(out, "Description-Content-Type: {content_type}");
            out.push('\n');
            out.push_str(&text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }

        Ok(out)
    }

    fn readme_contents(&self, readme: &Readme, source_dir: &Path) -> Result<(String, String)> {
        match readme {
            Readme::Path(path) => {
                let text = fs::read_to_string(source_dir.join(path))?;
                Ok((text, readme_content_type(path)?))
            }
            Readme::Table {
                file,
                text,
                content_type,
            } => match (file, text) {
                (Some(file), None) => {
                    let contents = fs::read_to_string(source_dir.join(file))?;
                    let content_type = match content_type {
                        Some(content_type) => content_type.clone(),
                        None => readme_content_type(file)?,
                    };
                    Ok((contents, content_type))
                }
                (None, Some(text)) => {
                    let content_type = content_type.clone().ok_or_else(|| {
                        Error::config(
                            "project.readme.content-type",
                            "required when `text` is used",
                        )
                    })?;
                    Ok((text.clone(), content_type))
                }
                _ => Err(Error::config(
                    "project.readme",
                    "exactly one of `file` and `text` must be specified",
                )),
            },
        }
    }
}

/// Fold a multi-line value into an RFC 822 header (continuation lines are
/// indented).
fn write_folded(out: &mut String, name: &str, value: &str) {
    let mut lines = value.lines();
    let _ = writeln!(out, "{name}: {}", lines.next().unwrap_or_default());
    for line in lines {
        if line.is_empty() {
            out.push_str("        \n");
        } else {
            let _ = writeln!(out, "        {line}");
        }
    }
}

fn readme_content_type(path: &str) -> Result<String> {
    let content_type = match Path::new(path).extension().and_then(|ext| ext.to_str()) {
        Some("md") => "text/markdown",
        Some("rst") => "text/x-rst",
        Some("txt") | None => "text/plain",
        Some(other) => {
            return Err(Error::config(
                "project.readme",
                format!("cannot determine content type for `.{other}` files"),
            ));
        }
    };
    Ok(content_type.to_string())
}

/// Expand a PEP 639 `license-files` glob relative to the source tree.
fn expand_license_glob(source_dir: &Path, pattern: &str) -> Result<Vec<String>> {
    let glob = globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| Error::config("project.license-files", err.to_string()))?
        .compile_matcher();
    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(source_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .expect("walkdir starts with root");
        if glob.is_match(relative) {
            matches.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    fn metadata(contents: &str) -> Result<ProjectMetadata> {
        let document: toml::Table = toml::from_str(contents).unwrap();
        ProjectMetadata::from_pyproject(&document)
    }

    #[test]
    fn test_minimal() {
        let m = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.2.3"
        "#})
        .unwrap();
        let rendered = m.core_metadata("1.2.3", Path::new(".")).unwrap();
        assert_snapshot!(rendered, @r###"
        Metadata-Version: 2.1
        Name: example
        Version: 1.2.3
        "###);
    }

    #[test]
    fn test_dynamic_version() {
        let m = metadata(indoc! {r#"
            [project]
            name = "example"
            dynamic = ["version"]
        "#})
        .unwrap();
        assert!(m.dynamic_version());
        assert_eq!(m.version(), None);
    }

    #[test]
    fn test_unsupported_dynamic_field() {
        let err = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.0"
            dynamic = ["dependencies"]
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("dynamic field `dependencies`"));
    }

    #[test]
    fn test_missing_version() {
        let err = metadata(indoc! {r#"
            [project]
            name = "example"
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("not declared dynamic"));
    }

    #[test]
    fn test_full_rendering() {
        let m = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.0.0"
            description = "An example package"
            keywords = ["demo", "meson"]
            classifiers = ["Programming Language :: Python"]
            requires-python = ">=3.8"
            license = "MIT"
            dependencies = ["numpy>=1.20"]
            authors = [{name = "Jane Doe", email = "jane@example.com"}]

            [project.optional-dependencies]
            test = ["pytest"]

            [project.urls]
            homepage = "https://example.com"
        "#})
        .unwrap();
        let rendered = m.core_metadata("1.0.0", Path::new(".")).unwrap();
        assert_snapshot!(rendered, @r###"
        Metadata-Version: 2.4
        Name: example
        Version: 1.0.0
        Summary: An example package
        Keywords: demo,meson
        Author-email: Jane Doe <jane@example.com>
        License-Expression: MIT
        Classifier: Programming Language :: Python
        Requires-Python: >=3.8
        Requires-Dist: numpy>=1.20
        Provides-Extra: test
        Requires-Dist: pytest ; extra == "test"
        Project-URL: homepage, https://example.com
        "###);
    }

    #[test]
    fn test_entry_points() {
        let m = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.0.0"

            [project.scripts]
            example = "example.cli:main"

            [project.entry-points."example.plugins"]
            builtin = "example.plugins:builtin"
        "#})
        .unwrap();
        assert_snapshot!(m.entry_points_txt().unwrap(), @r###"
        [console_scripts]
        example = example.cli:main

        [example.plugins]
        builtin = example.plugins:builtin

        "###);
    }

    #[test]
    fn test_reserved_entry_point_group() {
        let err = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.0.0"

            [project.entry-points.console_scripts]
            example = "example.cli:main"
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("project.scripts"));
    }

    #[test]
    fn test_no_entry_points() {
        let m = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.0.0"
        "#})
        .unwrap();
        assert_eq!(m.entry_points_txt(), None);
    }

    #[test]
    fn test_readme_text() {
        let m = metadata(indoc! {r##"
            [project]
            name = "example"
            version = "1.0.0"
            readme = {text = "# Example\n", content-type = "text/markdown"}
        "##})
        .unwrap();
        let rendered = m.core_metadata("1.0.0", Path::new(".")).unwrap();
        assert!(rendered.contains("Description-Content-Type: text/markdown"));
        assert!(rendered.ends_with("\n# Example\n"));
    }

    #[test]
    fn test_license_text_folding() {
        let m = metadata(indoc! {r#"
            [project]
            name = "example"
            version = "1.0.0"
            license = {text = "line one\nline two"}
        "#})
        .unwrap();
        let rendered = m.core_metadata("1.0.0", Path::new(".")).unwrap();
        assert!(rendered.contains("License: line one\n        line two\n"));
        // table-form license keeps the older metadata version
        assert!(rendered.starts_with("Metadata-Version: 2.1\n"));
    }
}
