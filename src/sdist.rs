//! Source distribution assembly.
//!
//! The source archive itself comes from `meson dist`, which exports the
//! version-controlled tree and honors export-ignore attributes. The backend
//! re-opens that tarball to turn it into a standards-compliant sdist: the
//! top-level directory is renamed to the normalized `{distname}-{version}`,
//! `PKG-INFO` is injected, and every entry is normalized for
//! reproducibility (pinned mtime, 0644/0755 modes, zero uid/gid).

use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs_err as fs;
use tar::{EntryType, Header};
use tracing::debug;

use crate::errors::{Error, Result};

/// Rewrite the `meson dist` tarball into the final sdist.
///
/// `mtime` pins every entry's timestamp; the pipeline passes the mtime of
/// the project's pyproject.toml.
pub fn rewrite_meson_dist(
    meson_dist_tarball: &Path,
    meson_dist_name: &str,
    dist_name: &str,
    pkg_info: &[u8],
    mtime: u64,
    output_dir: &Path,
) -> Result<PathBuf> {
    let staging = tempfile::Builder::new().prefix("mesonpy-sdist-").tempdir()?;
    debug!(
        tarball = %meson_dist_tarball.display(),
        staging = %staging.path().display(),
        "unpacking meson dist archive"
    );

    let tarball = BufReader::new(fs::File::open(meson_dist_tarball)?);
    tar::Archive::new(GzDecoder::new(tarball))
        .unpack(staging.path())
        .map_err(Error::Io)?;

    let root = staging.path().join(meson_dist_name);
    if !root.is_dir() {
        return Err(Error::Io(std::io::Error::other(format!(
            "meson dist archive does not contain `{meson_dist_name}`"
        ))));
    }

    let sdist_path = output_dir.join(format!("{dist_name}.tar.gz"));
    let encoder = GzEncoder::new(fs::File::create(&sdist_path)?, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    // PKG-INFO first, then the exported tree in sorted order
    let mut header = Header::new_gnu();
    header.set_size(pkg_info.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    tar.append_data(
        &mut header,
        Path::new(dist_name).join("PKG-INFO"),
        pkg_info,
    )?;

    for entry in walkdir::WalkDir::new(&root)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|err| {
            Error::Io(std::io::Error::other(format!(
                "failed to walk the extracted archive: {err}"
            )))
        })?;
        let relative = entry
            .path()
            .strip_prefix(&root)
            .expect("walkdir starts with root");
        let arcname = Path::new(dist_name).join(relative);
        let metadata = entry.metadata().map_err(|err| {
            Error::Io(std::io::Error::other(err.to_string()))
        })?;

        let mut header = Header::new_gnu();
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        if entry.file_type().is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_cksum();
            tar.append_data(&mut header, &arcname, std::io::empty())?;
        } else if entry.file_type().is_file() {
            header.set_mode(normalized_mode(&metadata));
            header.set_size(metadata.len());
            header.set_cksum();
            tar.append_data(
                &mut header,
                &arcname,
                BufReader::new(fs::File::open(entry.path())?),
            )?;
        }
        // anything else (symlinks out of the exported tree) is not
        // expected in a meson dist archive and is skipped
    }

    tar.into_inner()?.finish()?;
    debug!(path = %sdist_path.display(), "wrote sdist");
    Ok(sdist_path)
}

#[cfg(unix)]
fn normalized_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
