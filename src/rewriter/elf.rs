//! ELF runtime path editing through patchelf.
//!
//! patchelf is required on Linux; its absence is a build failure, not a
//! degraded mode, because a wheel with stale build-tree RPATHs would only
//! work on the machine that built it.

use std::path::Path;
use std::process::Command;

use crate::errors::{Error, Result};

/// Fail early when patchelf is not available.
pub(super) fn verify_patchelf() -> Result<()> {
    which::which("patchelf").map_err(|_| {
        Error::rewrite(
            "patchelf",
            "patchelf was not found; it is required to build non-pure wheels on Linux",
        )
    })?;
    Ok(())
}

pub(super) fn get_rpath(file: &Path) -> Result<Vec<String>> {
    let output = patchelf(file, &["--print-rpath"])?;
    Ok(output
        .trim()
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect())
}

pub(super) fn set_rpath(file: &Path, entries: &[String]) -> Result<()> {
    patchelf(file, &["--set-rpath", &entries.join(":")])?;
    Ok(())
}

fn patchelf(file: &Path, args: &[&str]) -> Result<String> {
    run_tool("patchelf", file, args)
}

/// Solaris has no patchelf; the system elfedit speaks the same RPATH
/// dialect.
pub(super) fn sunos_get_rpath(file: &Path) -> Result<Vec<String>> {
    let output = run_tool("/usr/bin/elfedit", file, &["-r", "-e", "dyn:rpath"])?;
    let mut rpath = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && matches!(fields[1], "RPATH" | "RUNPATH") {
            for entry in fields[3].split(':') {
                if !entry.is_empty() && !rpath.contains(&entry.to_string()) {
                    rpath.push(entry.to_string());
                }
            }
        }
    }
    Ok(rpath)
}

pub(super) fn sunos_set_rpath(file: &Path, entries: &[String]) -> Result<()> {
    run_tool(
        "/usr/bin/elfedit",
        file,
        &["-e", &format!("dyn:rpath {}", entries.join(":"))],
    )?;
    Ok(())
}

/// Run an editing tool with the target file as the last argument,
/// converting failures into [`Error::Rewrite`].
fn run_tool(tool: &str, file: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(tool)
        .args(args)
        .arg(file)
        .output()
        .map_err(|err| Error::rewrite(file, format!("failed to run {tool}: {err}")))?;
    if !output.status.success() {
        return Err(Error::rewrite(
            file,
            format!(
                "{tool} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    String::from_utf8(output.stdout)
        .map_err(|_| Error::rewrite(file, format!("{tool} produced non-UTF-8 output")))
}
