//! Editable wheel payload generation.
//!
//! An editable wheel installs almost nothing: a `.pth` file that imports a
//! loader module, and the loader module itself. The loader is generated
//! data, not shipped code: a Python template embedded in this crate with
//! the package set, the build directory, and the rebuild command
//! substituted in at packaging time. On first import of any covered
//! package it recompiles the project and installs an import hook that
//! resolves modules to the source tree (pure) or build tree (native).

use std::collections::BTreeSet;
use std::path::Path;

use crate::util::escape_distribution_name;

/// The loader module template; standalone interpreter-level source.
const LOADER_TEMPLATE: &str = include_str!("editable/loader.py");

/// The module and `.pth` base name for a distribution, e.g.
/// `_example_editable`.
pub fn loader_module_name(distname: &str) -> String {
    format!("_{}_editable", escape_distribution_name(distname))
}

/// Render the loader module for an editable wheel.
pub fn loader_module(
    distname: &str,
    top_level_modules: &BTreeSet<String>,
    build_dir: &Path,
    rebuild_command: &[String],
    verbose: bool,
) -> String {
    let names = python_string_list(top_level_modules.iter().map(String::as_str));
    let cmd = python_string_list(rebuild_command.iter().map(String::as_str));
    let verbose = if verbose { "True" } else { "False" };
    format!(
        "{LOADER_TEMPLATE}\n\
         install({names}, {build_dir}, {cmd}, {verbose})\n",
        build_dir = python_string(&build_dir.to_string_lossy()),
        names = names,
        cmd = cmd,
        verbose = verbose,
    )
}

/// The `.pth` contents activating the loader on interpreter startup.
pub fn pth_contents(distname: &str) -> String {
    format!("import {}\n", loader_module_name(distname))
}

fn python_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn python_string_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = values.map(python_string).collect();
    format!("[{}]", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_loader_module_name() {
        assert_eq!(loader_module_name("meson-python"), "_meson_python_editable");
    }

    #[test]
    fn test_pth_contents() {
        assert_eq!(pth_contents("example"), "import _example_editable\n");
    }

    #[test]
    fn test_loader_substitutions() {
        let modules: BTreeSet<String> =
            ["mypkg".to_string(), "other".to_string()].into_iter().collect();
        let rendered = loader_module(
            "example",
            &modules,
            Path::new("/tmp/build"),
            &["ninja".to_string()],
            true,
        );
        assert!(rendered.ends_with("install(['mypkg', 'other'], '/tmp/build', ['ninja'], True)\n"));
        // the template itself is included verbatim
        assert!(rendered.contains("class MesonpyMetaFinder"));
        assert!(rendered.contains("MESONPY_EDITABLE_VERBOSE"));
    }

    #[test]
    fn test_python_string_escaping() {
        assert_eq!(python_string(r"C:\build"), r"'C:\\build'");
        assert_eq!(python_string("it's"), r"'it\'s'");
    }
}
