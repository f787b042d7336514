//! Platform tag resolution.
//!
//! The platform portion of the wheel tag comes from the interpreter's
//! `sysconfig.get_platform()`, adjusted by the environment:
//! `_PYTHON_HOST_PLATFORM` overrides everything, `MACOSX_DEPLOYMENT_TARGET`
//! and `IPHONEOS_DEPLOYMENT_TARGET` pin Apple deployment targets, and
//! `ARCHFLAGS` can retarget a macOS build at the other architecture, which
//! additionally makes the build a cross build.

use std::env;

use crate::errors::{Error, Result};
use crate::interpreter::PythonInterpreter;

/// The resolved platform tag plus what the machine file generator needs to
/// know when the build targets a foreign architecture.
#[derive(Debug, Clone)]
pub struct ResolvedPlatform {
    /// The platform portion of the wheel tag.
    pub tag: String,
    /// Whether a cross file must be generated.
    pub cross: bool,
    /// Target cpu as spelled by Apple toolchains (`arm64`, `x86_64`).
    pub arch: String,
    /// Target system for the cross file's `[host_machine]` section.
    pub system: String,
}

impl ResolvedPlatform {
    /// Meson's `cpu_family` spelling of the target architecture.
    pub fn cpu_family(&self) -> &str {
        match self.arch.as_str() {
            "arm64" => "aarch64",
            other => other,
        }
    }
}

/// Resolve the platform tag for the given interpreter from the process
/// environment.
pub(crate) fn resolve_platform_tag(interpreter: &PythonInterpreter) -> Result<ResolvedPlatform> {
    from_parts(
        &interpreter.system,
        &interpreter.platform,
        env::var("_PYTHON_HOST_PLATFORM").ok().as_deref(),
        env::var("ARCHFLAGS").ok().as_deref(),
        env::var("MACOSX_DEPLOYMENT_TARGET").ok().as_deref(),
        env::var("IPHONEOS_DEPLOYMENT_TARGET").ok().as_deref(),
    )
}

/// The pure core of the resolver; everything observable is a parameter.
fn from_parts(
    system: &str,
    sysconfig_platform: &str,
    host_platform: Option<&str>,
    archflags: Option<&str>,
    macos_target: Option<&str>,
    ios_target: Option<&str>,
) -> Result<ResolvedPlatform> {
    let native_arch = sysconfig_platform
        .rsplit('-')
        .next()
        .unwrap_or(sysconfig_platform);
    let requested_arch = archflags.map(parse_archflags).transpose()?.flatten();

    if let Some(host_platform) = host_platform.filter(|value| !value.is_empty()) {
        // an explicit host platform wins, but it must not contradict ARCHFLAGS
        if let Some(arch) = &requested_arch {
            if !host_platform.ends_with(arch.as_str()) {
                return Err(Error::ConflictingCrossConfig {
                    archflags: arch.clone(),
                    host_platform: host_platform.to_string(),
                });
            }
        }
        let arch = requested_arch.unwrap_or_else(|| native_arch.to_string());
        return Ok(ResolvedPlatform {
            tag: host_platform.replace(['-', '.'], "_"),
            cross: arch != native_arch,
            arch,
            system: system.to_string(),
        });
    }

    match system {
        "darwin" => macos_tag(sysconfig_platform, macos_target, requested_arch),
        "ios" => ios_tag(sysconfig_platform, ios_target),
        "windows" => Ok(ResolvedPlatform {
            tag: sysconfig_platform.replace(['-', '.'], "_"),
            cross: false,
            arch: native_arch.to_string(),
            system: system.to_string(),
        }),
        // linux_{arch}; manylinux tags only ever come in via
        // _PYTHON_HOST_PLATFORM, the backend does not audit for them
        _ => Ok(ResolvedPlatform {
            tag: sysconfig_platform.replace(['-', '.'], "_").to_lowercase(),
            cross: false,
            arch: native_arch.to_string(),
            system: system.to_string(),
        }),
    }
}

/// Parse the repeated `-arch` tokens of `ARCHFLAGS`.
///
/// Returns the single requested architecture, `None` when the variable has
/// no `-arch` tokens at all.
fn parse_archflags(archflags: &str) -> Result<Option<String>> {
    let mut archs: Vec<&str> = archflags
        .split("-arch")
        .filter_map(|token| {
            let token = token.trim();
            (!token.is_empty()).then_some(token)
        })
        .collect();
    archs.dedup();
    match archs.as_slice() {
        [] => Ok(None),
        [arch] => Ok(Some((*arch).to_string())),
        _ => Err(Error::config(
            "ARCHFLAGS",
            "exactly one architecture may be requested",
        )),
    }
}

/// macOS: `macosx_{major}_{minor}_{arch}`.
fn macos_tag(
    sysconfig_platform: &str,
    deployment_target: Option<&str>,
    requested_arch: Option<String>,
) -> Result<ResolvedPlatform> {
    // sysconfig reports e.g. "macosx-10.9-x86_64"
    let mut parts = sysconfig_platform.splitn(3, '-');
    let (version, native_arch) = match (parts.next(), parts.next(), parts.next()) {
        (Some("macosx"), Some(version), Some(arch)) => (version, arch),
        _ => {
            return Err(Error::UnsupportedInterpreter(format!(
                "unexpected macOS sysconfig platform `{sysconfig_platform}`"
            )));
        }
    };

    let (mut major, mut minor) = match deployment_target {
        Some(target) => parse_version_pair(target, "MACOSX_DEPLOYMENT_TARGET")?,
        None => parse_version_pair(version, "sysconfig platform")?,
    };

    let arch = requested_arch.unwrap_or_else(|| native_arch.to_string());
    let cross = arch != native_arch;

    // the arm64 toolchain does not go below 11.0
    if arch == "arm64" && major < 11 {
        (major, minor) = (11, 0);
    }
    // pip only understands (major, 0) starting with macOS 11
    if major >= 11 {
        minor = 0;
    }

    Ok(ResolvedPlatform {
        tag: format!("macosx_{major}_{minor}_{arch}"),
        cross,
        arch,
        system: "darwin".to_string(),
    })
}

/// iOS: `ios_{major}_{minor}_{arch}_{abi}` where the abi distinguishes the
/// simulator from device builds.
fn ios_tag(sysconfig_platform: &str, deployment_target: Option<&str>) -> Result<ResolvedPlatform> {
    // sysconfig reports e.g. "ios-13.0-arm64-iphoneos"
    let parts: Vec<&str> = sysconfig_platform.split('-').collect();
    let [_, version, arch, abi] = parts.as_slice() else {
        return Err(Error::UnsupportedInterpreter(format!(
            "unexpected iOS sysconfig platform `{sysconfig_platform}`"
        )));
    };
    let (major, minor) = match deployment_target {
        Some(target) => parse_version_pair(target, "IPHONEOS_DEPLOYMENT_TARGET")?,
        None => parse_version_pair(version, "sysconfig platform")?,
    };
    Ok(ResolvedPlatform {
        tag: format!("ios_{major}_{minor}_{arch}_{abi}"),
        cross: false,
        arch: (*arch).to_string(),
        system: "ios".to_string(),
    })
}

fn parse_version_pair(value: &str, what: &str) -> Result<(u32, u32)> {
    let mut parts = value.splitn(3, '.');
    let major = parts
        .next()
        .and_then(|major| major.parse().ok())
        .ok_or_else(|| Error::config(what, format!("invalid version `{value}`")))?;
    let minor = match parts.next() {
        Some(minor) => minor
            .parse()
            .map_err(|_| Error::config(what, format!("invalid version `{value}`")))?,
        None => 0,
    };
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tag(
        system: &str,
        platform: &str,
        host_platform: Option<&str>,
        archflags: Option<&str>,
        macos_target: Option<&str>,
    ) -> Result<ResolvedPlatform> {
        from_parts(system, platform, host_platform, archflags, macos_target, None)
    }

    #[test]
    fn test_linux() {
        let resolved = tag("linux", "linux-x86_64", None, None, None).unwrap();
        assert_eq!(resolved.tag, "linux_x86_64");
        assert!(!resolved.cross);
    }

    #[test]
    fn test_host_platform_override() {
        let resolved = tag(
            "linux",
            "linux-x86_64",
            Some("manylinux_2_17_x86_64"),
            None,
            None,
        )
        .unwrap();
        assert_eq!(resolved.tag, "manylinux_2_17_x86_64");
        assert!(!resolved.cross);
    }

    #[test]
    fn test_windows() {
        let resolved = tag("windows", "win-amd64", None, None, None).unwrap();
        assert_eq!(resolved.tag, "win_amd64");
        let resolved = tag("windows", "win32", None, None, None).unwrap();
        assert_eq!(resolved.tag, "win32");
        let resolved = tag("windows", "win-arm64", None, None, None).unwrap();
        assert_eq!(resolved.tag, "win_arm64");
    }

    #[test]
    fn test_macos_deployment_target() {
        let resolved = tag("darwin", "macosx-10.9-x86_64", None, None, None).unwrap();
        assert_eq!(resolved.tag, "macosx_10_9_x86_64");

        let resolved =
            tag("darwin", "macosx-10.9-x86_64", None, None, Some("10.15")).unwrap();
        assert_eq!(resolved.tag, "macosx_10_15_x86_64");

        // 11+ squashes the minor version
        let resolved =
            tag("darwin", "macosx-10.9-x86_64", None, None, Some("12.3")).unwrap();
        assert_eq!(resolved.tag, "macosx_12_0_x86_64");

        // a bare major version is accepted
        let resolved = tag("darwin", "macosx-10.9-x86_64", None, None, Some("12")).unwrap();
        assert_eq!(resolved.tag, "macosx_12_0_x86_64");
    }

    #[test]
    fn test_macos_arm64_minimum() {
        let resolved = tag("darwin", "macosx-10.9-arm64", None, None, None).unwrap();
        assert_eq!(resolved.tag, "macosx_11_0_arm64");
    }

    #[test]
    fn test_archflags_cross() {
        let resolved = tag(
            "darwin",
            "macosx-10.9-x86_64",
            None,
            Some("-arch arm64"),
            None,
        )
        .unwrap();
        assert_eq!(resolved.tag, "macosx_11_0_arm64");
        assert!(resolved.cross);
        assert_eq!(resolved.arch, "arm64");
        assert_eq!(resolved.cpu_family(), "aarch64");
    }

    #[test]
    fn test_archflags_native_is_not_cross() {
        let resolved = tag(
            "darwin",
            "macosx-11.0-arm64",
            None,
            Some("-arch arm64"),
            None,
        )
        .unwrap();
        assert!(!resolved.cross);
    }

    #[test]
    fn test_archflags_multiple_archs() {
        let err = tag(
            "darwin",
            "macosx-10.9-x86_64",
            None,
            Some("-arch x86_64 -arch arm64"),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one architecture"));
    }

    #[test]
    fn test_archflags_host_platform_conflict() {
        let err = tag(
            "darwin",
            "macosx-10.9-x86_64",
            Some("macosx-11.0-x86_64"),
            Some("-arch arm64"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConflictingCrossConfig { .. }));
    }

    #[test]
    fn test_ios() {
        let resolved = from_parts(
            "ios",
            "ios-13.0-arm64-iphoneos",
            None,
            None,
            None,
            Some("15.4"),
        )
        .unwrap();
        assert_eq!(resolved.tag, "ios_15_4_arm64_iphoneos");
    }

    #[test]
    fn test_bsd_fallback() {
        let resolved = tag("freebsd", "freebsd-14.0-RELEASE-amd64", None, None, None).unwrap();
        assert_eq!(resolved.tag, "freebsd_14_0_release_amd64");
    }
}
