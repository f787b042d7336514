use data_encoding::BASE64URL_NOPAD;
use sha2::{Digest, Sha256};
use std::io;
use zip::DateTime;

/// Read the input and write it to the output, hashing it on the way through.
///
/// Returns the number of bytes written and the `RECORD`-style digest
/// (`sha256=<urlsafe base64 without padding>`).
pub(crate) fn copy_and_hash(
    reader: &mut impl io::Read,
    writer: &mut impl io::Write,
) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0; 8 * 1024];
    let mut written = 0;
    loop {
        let len = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(len) => len,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..len]);
        writer.write_all(&buf[..len])?;
        written += len as u64;
    }
    Ok((
        written,
        format!("sha256={}", BASE64URL_NOPAD.encode(&hasher.finalize())),
    ))
}

/// `RECORD`-style digest of a byte slice.
pub(crate) fn record_hash(bytes: &[u8]) -> String {
    format!(
        "sha256={}",
        BASE64URL_NOPAD.encode(&Sha256::new().chain_update(bytes).finalize())
    )
}

/// Returns a DateTime representing the value of the SOURCE_DATE_EPOCH
/// environment variable. Note that the earliest timestamp a zip file can
/// represent is 1980-01-01.
pub(crate) fn zip_mtime() -> DateTime {
    let res: Result<DateTime, Box<dyn std::error::Error>> = (|| {
        let epoch: i64 = std::env::var("SOURCE_DATE_EPOCH")?.parse()?;
        let dt = time::OffsetDateTime::from_unix_timestamp(epoch)?;
        let dt = DateTime::try_from(dt)?;
        Ok(dt)
    })();

    res.unwrap_or_default()
}

/// Terminal escape codes for user-facing output, all empty when color is
/// disabled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Style {
    pub cyan: &'static str,
    pub yellow: &'static str,
    pub bold: &'static str,
    pub reset: &'static str,
}

const COLORS: Style = Style {
    cyan: "\x1b[36m",
    yellow: "\x1b[93m",
    bold: "\x1b[1m",
    reset: "\x1b[0m",
};

const NO_COLORS: Style = Style {
    cyan: "",
    yellow: "",
    bold: "",
    reset: "",
};

/// Resolve the output style from NO_COLOR, FORCE_COLOR, and whether stderr
/// is a terminal. NO_COLOR wins when both are set.
pub(crate) fn style() -> Style {
    use std::io::IsTerminal;

    if std::env::var_os("NO_COLOR").is_some() {
        if std::env::var_os("FORCE_COLOR").is_some() {
            eprintln!("warning: both NO_COLOR and FORCE_COLOR are set, disabling color");
        }
        NO_COLORS
    } else if std::env::var_os("FORCE_COLOR").is_some() || std::io::stderr().is_terminal() {
        COLORS
    } else {
        NO_COLORS
    }
}

/// Levenshtein edit distance, used for the did-you-mean suggestions on
/// unknown configuration keys.
pub(crate) fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            let val = (prev + cost).min(row[j + 1] + 1).min(row[j] + 1);
            prev = row[j + 1];
            row[j + 1] = val;
        }
    }
    row[b.len()]
}

/// The closest candidate within an edit distance small enough to plausibly
/// be a typo, if any.
pub(crate) fn closest_match<'a>(
    key: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    candidates
        .into_iter()
        .map(|candidate| (edit_distance(key, candidate), candidate))
        .filter(|(distance, candidate)| *distance <= candidate.len() / 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

/// Escape a distribution name for use in wheel and dist-info file names.
///
/// Runs of `-`, `_` and `.` collapse to a single underscore, per the wheel
/// filename escaping rules.
pub(crate) fn escape_distribution_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_run {
                escaped.push('_');
            }
            in_run = true;
        } else {
            escaped.push(c);
            in_run = false;
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_hash() {
        // sha256 of the empty input, urlsafe base64, no padding
        assert_eq!(
            record_hash(b""),
            "sha256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn test_copy_and_hash_matches_record_hash() {
        let data = b"show me the hashes";
        let mut out = Vec::new();
        let (written, digest) = copy_and_hash(&mut &data[..], &mut out).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(digest, record_hash(data));
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("setup-args", "setup-args"), 0);
        assert_eq!(edit_distance("setup-arg", "setup-args"), 1);
        assert_eq!(edit_distance("stup-args", "setup-args"), 1);
        assert_eq!(edit_distance("", "abc"), 3);
    }

    #[test]
    fn test_closest_match() {
        let keys = ["build-dir", "setup-args", "compile-args"];
        assert_eq!(
            closest_match("setup-arg", keys).as_deref(),
            Some("setup-args")
        );
        assert_eq!(closest_match("frobnicate", keys), None);
    }

    #[test]
    fn test_escape_distribution_name() {
        assert_eq!(escape_distribution_name("meson-python"), "meson_python");
        assert_eq!(escape_distribution_name("a.b-c_d"), "a_b_c_d");
        assert_eq!(escape_distribution_name("a--b"), "a_b");
        assert_eq!(escape_distribution_name("plain"), "plain");
    }
}
