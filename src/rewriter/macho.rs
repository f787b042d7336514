//! Mach-O runtime path editing through otool and install_name_tool.

use std::path::Path;
use std::process::Command;

use crate::errors::{Error, Result};

pub(super) fn get_rpath(file: &Path) -> Result<Vec<String>> {
    load_commands(file, "LC_RPATH", "path")
}

/// install_name_tool edits incrementally: delete what went away, add what
/// is new. Ordering of additions follows the new list so repeated builds
/// produce identical load commands.
pub(super) fn set_rpath(file: &Path, old: &[String], new: &[String]) -> Result<()> {
    let mut args: Vec<String> = Vec::new();
    for path in old {
        if !new.contains(path) {
            args.push("-delete_rpath".to_string());
            args.push(path.clone());
        }
    }
    for path in new {
        if !old.contains(path) {
            args.push("-add_rpath".to_string());
            args.push(path.clone());
        }
    }
    if !args.is_empty() {
        install_name_tool(file, &args)?;
    }
    Ok(())
}

/// Redirect `LC_LOAD_DYLIB` references into the build tree at the in-wheel
/// libs directory, `@loader_path`-relative.
pub(super) fn fix_load_dylibs(
    file: &Path,
    build_dir: &Path,
    libs_rpath: Option<&str>,
) -> Result<()> {
    let Some(libs_rpath) = libs_rpath else {
        return Ok(());
    };
    for dylib in load_commands(file, "LC_LOAD_DYLIB", "name")? {
        let dylib_path = Path::new(&dylib);
        if dylib_path.starts_with(build_dir) {
            let name = dylib_path
                .file_name()
                .ok_or_else(|| Error::rewrite(file, format!("bad dylib reference `{dylib}`")))?
                .to_string_lossy();
            let replacement = if libs_rpath.is_empty() || libs_rpath == "." {
                format!("@loader_path/{name}")
            } else {
                format!("@loader_path/{libs_rpath}/{name}")
            };
            install_name_tool(
                file,
                &["-change".to_string(), dylib.clone(), replacement],
            )?;
        }
    }
    Ok(())
}

/// Parse `otool -l` output for one load command kind, collecting the given
/// field of each matching command.
fn load_commands(file: &Path, command: &str, field: &str) -> Result<Vec<String>> {
    let output = Command::new("otool")
        .args(["-l"])
        .arg(file)
        .output()
        .map_err(|err| Error::rewrite(file, format!("failed to run otool: {err}")))?;
    if !output.status.success() {
        return Err(Error::rewrite(
            file,
            format!(
                "otool -l failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);

    let mut entries = Vec::new();
    let mut in_command = false;
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["cmd", name, ..] => in_command = *name == command,
            [key, value, ..] if in_command && key == &field => {
                entries.push((*value).to_string());
                in_command = false;
            }
            _ => {}
        }
    }
    Ok(entries)
}

fn install_name_tool(file: &Path, args: &[String]) -> Result<()> {
    let output = Command::new("install_name_tool")
        .args(args)
        .arg(file)
        .output()
        .map_err(|err| Error::rewrite(file, format!("failed to run install_name_tool: {err}")))?;
    if !output.status.success() {
        return Err(Error::rewrite(
            file,
            format!(
                "install_name_tool failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}
