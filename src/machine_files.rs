//! Meson machine file generation.
//!
//! Meson learns which Python to build against through a native file, and
//! which toolchain to target through a cross file. Both are INI-style,
//! UTF-8, and written under the build directory so they never pollute the
//! source tree. Generation is a pure function of the environment, the
//! resolved tag, and the build directory.

use std::env;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::debug;

use crate::errors::Result;
use crate::interpreter::{PythonInterpreter, ResolvedPlatform};

pub const NATIVE_FILE_NAME: &str = "mesonpy-native-file.ini";
pub const CROSS_FILE_NAME: &str = "mesonpy-cross-file.ini";

/// The machine files handed to `meson setup`.
#[derive(Debug, Clone)]
pub struct MachineFiles {
    pub native: PathBuf,
    pub cross: Option<PathBuf>,
}

/// Write the native file and, when the build targets a foreign
/// architecture, the cross file.
pub fn write_machine_files(
    interpreter: &PythonInterpreter,
    cross: Option<&ResolvedPlatform>,
    build_dir: &Path,
) -> Result<MachineFiles> {
    let compilers = Compilers::from_env();

    let native = build_dir.join(NATIVE_FILE_NAME);
    fs::write(&native, native_file_contents(interpreter, &compilers))?;
    debug!(path = %native.display(), "wrote native file");

    let cross = match cross {
        Some(platform) => {
            let path = build_dir.join(CROSS_FILE_NAME);
            fs::write(&path, cross_file_contents(platform, &compilers))?;
            debug!(path = %path.display(), "wrote cross file");
            Some(path)
        }
        None => None,
    };

    Ok(MachineFiles { native, cross })
}

/// Compiler overrides picked up from the environment.
#[derive(Debug, Clone, Default)]
struct Compilers {
    c: Option<String>,
    cpp: Option<String>,
    objc: Option<String>,
    objcpp: Option<String>,
}

impl Compilers {
    fn from_env() -> Self {
        Compilers {
            c: env::var("CC").ok(),
            cpp: env::var("CXX").ok(),
            objc: env::var("OBJC").ok(),
            objcpp: env::var("OBJCXX").ok(),
        }
    }
}

fn native_file_contents(interpreter: &PythonInterpreter, compilers: &Compilers) -> String {
    let mut out = String::new();
    out.push_str("[binaries]\n");
    let _ = writeln!(out, "python = {}", quote(&interpreter.config.executable));
    for (name, value) in [
        ("c", &compilers.c),
        ("cpp", &compilers.cpp),
        ("objc", &compilers.objc),
        ("objcpp", &compilers.objcpp),
    ] {
        if let Some(value) = value {
            let _ = writeln!(out, "{name} = {}", quote_command(value));
        }
    }
    out.push('\n');
    out.push_str("[properties]\n");
    let _ = writeln!(out, "prefix = {}", quote(&interpreter.base_prefix));
    let _ = writeln!(out, "purelibdir = {}", quote(&interpreter.purelib));
    let _ = writeln!(out, "platlibdir = {}", quote(&interpreter.platlib));
    out
}

fn cross_file_contents(platform: &ResolvedPlatform, compilers: &Compilers) -> String {
    let arch_args = format!("'-arch', {}", quote(&platform.arch));
    let command = |default: &str, overridden: &Option<String>| {
        let base = overridden.as_deref().unwrap_or(default);
        format!("[{}, {arch_args}]", quote(base))
    };

    let mut out = String::new();
    out.push_str("[binaries]\n");
    let _ = writeln!(out, "c = {}", command("cc", &compilers.c));
    let _ = writeln!(out, "cpp = {}", command("c++", &compilers.cpp));
    if platform.system == "darwin" {
        let _ = writeln!(out, "objc = {}", command("cc", &compilers.objc));
        let _ = writeln!(out, "objcpp = {}", command("c++", &compilers.objcpp));
    }
    let _ = writeln!(out, "strip = {}", quote("strip"));
    out.push('\n');
    out.push_str("[host_machine]\n");
    let _ = writeln!(out, "system = {}", quote(&platform.system));
    let _ = writeln!(out, "cpu_family = {}", quote(platform.cpu_family()));
    let _ = writeln!(out, "cpu = {}", quote(&platform.arch));
    out.push_str("endian = 'little'\n");
    out.push('\n');
    out.push_str("[properties]\n");
    out.push_str("needs_exe_wrapper = false\n");
    out
}

/// Quote a string the way Meson machine files expect.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Compiler environment variables may carry arguments (`CC="ccache cc"`);
/// Meson wants those as an array.
fn quote_command(value: &str) -> String {
    let words: Vec<&str> = value.split_whitespace().collect();
    match words.as_slice() {
        [single] => quote(single),
        words => {
            let quoted: Vec<String> = words.iter().map(|word| quote(word)).collect();
            format!("[{}]", quoted.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    fn interpreter() -> PythonInterpreter {
        crate::interpreter::tests::linux_cpython()
    }

    #[test]
    fn test_native_file() {
        let contents = native_file_contents(&interpreter(), &Compilers::default());
        assert_snapshot!(contents, @r###"
        [binaries]
        python = '/usr/bin/python3.11'

        [properties]
        prefix = '/usr'
        purelibdir = '/usr/lib/python3.11/site-packages'
        platlibdir = '/usr/lib64/python3.11/site-packages'
        "###);
    }

    #[test]
    fn test_native_file_compiler_override() {
        let compilers = Compilers {
            c: Some("ccache cc".to_string()),
            ..Compilers::default()
        };
        let contents = native_file_contents(&interpreter(), &compilers);
        assert!(contents.contains("c = ['ccache', 'cc']\n"));
    }

    #[test]
    fn test_cross_file() {
        let platform = ResolvedPlatform {
            tag: "macosx_11_0_arm64".to_string(),
            cross: true,
            arch: "arm64".to_string(),
            system: "darwin".to_string(),
        };
        let contents = cross_file_contents(&platform, &Compilers::default());
        assert_snapshot!(contents, @r###"
        [binaries]
        c = ['cc', '-arch', 'arm64']
        cpp = ['c++', '-arch', 'arm64']
        objc = ['cc', '-arch', 'arm64']
        objcpp = ['c++', '-arch', 'arm64']
        strip = 'strip'

        [host_machine]
        system = 'darwin'
        cpu_family = 'aarch64'
        cpu = 'arm64'
        endian = 'little'

        [properties]
        needs_exe_wrapper = false
        "###);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it\'s'");
        assert_eq!(quote(r"C:\python"), r"'C:\\python'");
    }
}
