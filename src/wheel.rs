//! Wheel archive assembly.
//!
//! A wheel is a zip file with a prescribed filename, a `dist-info`
//! directory, and a `RECORD` manifest hashing every other entry. Assembly
//! here is deterministic: callers add payload entries in sorted order,
//! timestamps come from `SOURCE_DATE_EPOCH`, permissions are normalized to
//! 0644/0755, and the `RECORD` self-entry carries empty hash and size
//! fields, as the format requires.

use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use regex::bytes::Regex;
use tracing::{debug, trace};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::errors::Result;
use crate::interpreter::{PythonInterpreter, WheelTag};
use crate::util::{copy_and_hash, escape_distribution_name, record_hash, zip_mtime};

/// An entry in the `RECORD` file.
struct RecordEntry {
    path: String,
    hash: String,
    size: u64,
}

/// Writes one wheel archive.
pub struct WheelWriter {
    archive: ZipWriter<fs::File>,
    record: Vec<RecordEntry>,
    wheel_path: PathBuf,
    basename: String,
    tag: WheelTag,
}

impl WheelWriter {
    /// Create `{distname}-{version}-{tag}.whl` in the output directory.
    pub fn new(output_dir: &Path, distname: &str, version: &str, tag: &WheelTag) -> Result<Self> {
        let basename = format!("{}-{}", escape_distribution_name(distname), version);
        let wheel_path = output_dir.join(format!("{basename}-{tag}.whl"));
        debug!(path = %wheel_path.display(), "creating wheel");
        let file = fs::File::create(&wheel_path)?;
        Ok(WheelWriter {
            archive: ZipWriter::new(file),
            record: Vec::new(),
            wheel_path,
            basename,
            tag: tag.clone(),
        })
    }

    pub fn dist_info_dir(&self) -> String {
        format!("{}.dist-info", self.basename)
    }

    pub fn data_dir(&self) -> String {
        format!("{}.data", self.basename)
    }

    fn file_options(&self, executable: bool) -> FileOptions {
        let mode = if executable { 0o755 } else { 0o644 };
        FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode)
            .last_modified_time(zip_mtime())
    }

    /// Add an entry from a byte buffer.
    pub fn add_bytes(&mut self, dest: &str, bytes: &[u8], executable: bool) -> Result<()> {
        trace!("adding {dest}");
        self.archive.start_file(dest, self.file_options(executable))?;
        self.archive.write_all(bytes)?;
        self.record.push(RecordEntry {
            path: dest.to_string(),
            hash: record_hash(bytes),
            size: bytes.len() as u64,
        });
        Ok(())
    }

    /// Add an entry from a file on disk, streaming and hashing it.
    /// Symlinked origins are materialized as regular entries.
    pub fn add_file(&mut self, dest: &str, origin: &Path, executable: bool) -> Result<()> {
        trace!("adding {dest} from {}", origin.display());
        self.archive.start_file(dest, self.file_options(executable))?;
        let mut reader = BufReader::new(fs::File::open(origin)?);
        let (size, hash) = copy_and_hash(&mut reader, &mut self.archive)?;
        self.record.push(RecordEntry {
            path: dest.to_string(),
            hash,
            size,
        });
        Ok(())
    }

    /// Add a script, rewriting its shebang when it points at the build
    /// interpreter; installers substitute the final interpreter path for
    /// `#!python` at install time.
    pub fn add_script(
        &mut self,
        dest: &str,
        origin: &Path,
        interpreter: &PythonInterpreter,
    ) -> Result<()> {
        let contents = fs::read(origin)?;
        match rewrite_shebang(&contents, interpreter) {
            Some(rewritten) => self.add_bytes(dest, &rewritten, true),
            None => {
                let executable = is_executable(origin);
                self.add_file(dest, origin, executable)
            }
        }
    }

    /// Write the dist-info directory and close the archive. Consumes the
    /// writer; the `RECORD` is the final entry.
    pub fn finish(
        mut self,
        metadata: &[u8],
        entry_points: Option<&str>,
    ) -> Result<PathBuf> {
        let dist_info = self.dist_info_dir();
        self.add_bytes(&format!("{dist_info}/METADATA"), metadata, false)?;
        let wheel_info = wheel_info_contents(&self.tag);
        self.add_bytes(&format!("{dist_info}/WHEEL"), wheel_info.as_bytes(), false)?;
        if let Some(entry_points) = entry_points {
            self.add_bytes(
                &format!("{dist_info}/entry_points.txt"),
                entry_points.as_bytes(),
                false,
            )?;
        }

        let record_path = format!("{dist_info}/RECORD");
        trace!("adding {record_path}");
        let record = render_record(&record_path, &self.record)?;
        self.archive
            .start_file(record_path.as_str(), self.file_options(false))?;
        self.archive.write_all(&record)?;
        self.archive.finish()?;
        Ok(self.wheel_path)
    }
}

/// The `WHEEL` metadata file.
fn wheel_info_contents(tag: &WheelTag) -> String {
    format!(
        "Wheel-Version: 1.0\n\
         Generator: mesonpy {}\n\
         Root-Is-Purelib: {}\n\
         Tag: {}\n",
        env!("CARGO_PKG_VERSION"),
        tag.purelib_only,
        tag,
    )
}

/// Render the `RECORD` manifest; the RECORD itself is listed with empty
/// hash and size.
fn render_record(record_path: &str, entries: &[RecordEntry]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in entries {
        writer
            .write_record(&[
                entry.path.clone(),
                entry.hash.clone(),
                entry.size.to_string(),
            ])
            .map_err(|err| std::io::Error::other(err.to_string()))?;
    }
    writer
        .write_record(&[record_path, "", ""])
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(writer
        .into_inner()
        .map_err(|err| std::io::Error::other(err.to_string()))?)
}

/// Replace a shebang pointing at the build interpreter with the `#!python`
/// placeholder. Returns `None` when the file should be shipped untouched.
fn rewrite_shebang(contents: &[u8], interpreter: &PythonInterpreter) -> Option<Vec<u8>> {
    let regex = Regex::new(r"^#!\s*(?P<path>\S+)").unwrap();
    let first_line_end = contents
        .iter()
        .position(|byte| *byte == b'\n')
        .unwrap_or(contents.len());
    let captures = regex.captures(&contents[..first_line_end])?;
    let path = std::str::from_utf8(captures.name("path")?.as_bytes()).ok()?;
    if !path.contains("python") || !interpreter.owns_shebang(path) {
        return None;
    }
    let mut rewritten = Vec::with_capacity(contents.len());
    rewritten.extend_from_slice(b"#!python");
    rewritten.extend_from_slice(&contents[first_line_end..]);
    Some(rewritten)
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use zip::ZipArchive;

    fn interpreter() -> PythonInterpreter {
        crate::interpreter::tests::linux_cpython()
    }

    fn build_wheel(dir: &Path) -> PathBuf {
        let mut writer =
            WheelWriter::new(dir, "example", "1.0.0", &WheelTag::pure()).unwrap();
        writer
            .add_bytes("example/__init__.py", b"__version__ = '1.0.0'\n", false)
            .unwrap();
        writer
            .add_bytes("example/core.py", b"def answer():\n    return 42\n", false)
            .unwrap();
        writer
            .finish(b"Metadata-Version: 2.1\nName: example\nVersion: 1.0.0\n", None)
            .unwrap()
    }

    #[test]
    fn test_wheel_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_wheel(dir.path());
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "example-1.0.0-py3-none-any.whl"
        );
    }

    #[test]
    fn test_record_completeness() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_wheel(dir.path());

        let mut archive = ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "example/__init__.py",
                "example/core.py",
                "example-1.0.0.dist-info/METADATA",
                "example-1.0.0.dist-info/WHEEL",
                "example-1.0.0.dist-info/RECORD",
            ]
        );

        let mut record = String::new();
        archive
            .by_name("example-1.0.0.dist-info/RECORD")
            .unwrap()
            .read_to_string(&mut record)
            .unwrap();
        // every archive member appears exactly once
        for name in &names {
            assert_eq!(
                record.lines().filter(|line| line.starts_with(name.as_str())).count(),
                1,
                "{name} missing from RECORD"
            );
        }
        // the RECORD entry for itself has empty hash and size
        let self_entry = record
            .lines()
            .find(|line| line.starts_with("example-1.0.0.dist-info/RECORD"))
            .unwrap();
        assert_eq!(self_entry, "example-1.0.0.dist-info/RECORD,,");

        // hashes match contents
        let entry = record
            .lines()
            .find(|line| line.starts_with("example/__init__.py"))
            .unwrap();
        let hash = entry.split(',').nth(1).unwrap();
        assert_eq!(hash, record_hash(b"__version__ = '1.0.0'\n"));
    }

    #[test]
    fn test_wheel_info() {
        let tag = WheelTag {
            python: "cp311".to_string(),
            abi: "cp311".to_string(),
            platform: "linux_x86_64".to_string(),
            purelib_only: false,
        };
        let expected = format!(
            "Wheel-Version: 1.0\nGenerator: mesonpy {}\nRoot-Is-Purelib: false\nTag: cp311-cp311-linux_x86_64\n",
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(wheel_info_contents(&tag), expected);
    }

    #[test]
    fn test_reproducibility() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        let first = fs::read(build_wheel(&a)).unwrap();
        let second = fs::read(build_wheel(&b)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_shebang_rewrite() {
        let interpreter = interpreter();
        let script = b"#!/usr/bin/python3.11\nprint('hi')\n";
        let rewritten = rewrite_shebang(script, &interpreter).unwrap();
        assert_eq!(rewritten, b"#!python\nprint('hi')\n");

        // a foreign interpreter is left alone
        assert_eq!(
            rewrite_shebang(b"#!/opt/other/bin/python3\n", &interpreter),
            None
        );
        // non-python shebangs are left alone
        assert_eq!(rewrite_shebang(b"#!/bin/sh\necho hi\n", &interpreter), None);
        // binaries are left alone
        assert_eq!(rewrite_shebang(b"\x7fELF\x02", &interpreter), None);
    }

    #[test]
    fn test_executable_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            WheelWriter::new(dir.path(), "example", "1.0.0", &WheelTag::pure()).unwrap();
        writer.add_bytes("tool", b"#!python\n", true).unwrap();
        let path = writer.finish(b"stub", None).unwrap();

        let mut archive = ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let entry = archive.by_name("tool").unwrap();
        assert_eq!(entry.unix_mode(), Some(0o755));
    }
}
