//! Target platform model.
//!
//! Platforms are compared by their normalized form so that `x86_64` and
//! `amd64`, or `arm64/v8` and `arm64`, select the same manifest entry.

use serde::{Deserialize, Serialize};

use crate::error::{CimageError, Result};

const KNOWN_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "js", "linux",
    "nacl", "netbsd", "openbsd", "plan9", "solaris", "windows", "zos",
];

const KNOWN_ARCH: &[&str] = &[
    "386", "amd64", "arm", "arm64", "loong64", "mips", "mips64", "mips64le", "mipsle", "ppc64",
    "ppc64le", "riscv64", "s390x", "wasm",
];

/// Operating system, CPU architecture and optional variant of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: variant.to_string(),
        }
    }

    /// The platform this binary was compiled for.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self::new(os, arch, "").normalize()
    }

    /// Parse `os`, `arch`, `os/arch` or `os/arch/variant`.
    ///
    /// A single component is read as an operating system when it names a
    /// known one (architecture taken from the host), otherwise as an
    /// architecture (operating system taken from the host).
    pub fn parse(specifier: &str) -> Result<Self> {
        let parts: Vec<&str> = specifier.split('/').collect();
        for part in &parts {
            let valid = !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(CimageError::InvalidPlatform(format!(
                    "'{}' is an invalid component of '{}'",
                    part, specifier
                )));
            }
        }

        let host = Self::host();
        let platform = match parts.as_slice() {
            [single] => {
                let os = normalize_os(single);
                if KNOWN_OS.contains(&os.as_str()) {
                    Self {
                        os,
                        ..host
                    }
                } else {
                    let (architecture, variant) = normalize_arch(single, "");
                    if !KNOWN_ARCH.contains(&architecture.as_str()) {
                        return Err(CimageError::InvalidPlatform(format!(
                            "'{}': unknown operating system or architecture",
                            specifier
                        )));
                    }
                    Self {
                        architecture,
                        os: host.os,
                        variant,
                    }
                }
            }
            [os, arch] => {
                let (architecture, variant) = normalize_arch(arch, "");
                Self {
                    architecture,
                    os: normalize_os(os),
                    variant,
                }
            }
            [os, arch, variant] => {
                let (architecture, variant) = normalize_arch(arch, variant);
                Self {
                    architecture,
                    os: normalize_os(os),
                    variant,
                }
            }
            _ => {
                return Err(CimageError::InvalidPlatform(format!(
                    "'{}': cannot parse platform specifier",
                    specifier
                )))
            }
        };
        Ok(platform)
    }

    /// Parse a comma separated list of platform specifiers.
    pub fn parse_list(specifiers: &str) -> Result<Vec<Self>> {
        specifiers
            .split(',')
            .map(|s| Self::parse(s.trim()))
            .collect()
    }

    /// Canonical form used for comparisons.
    pub fn normalize(&self) -> Self {
        let (architecture, variant) = normalize_arch(&self.architecture, &self.variant);
        Self {
            architecture,
            os: normalize_os(&self.os),
            variant,
        }
    }

    /// Whether two platforms select the same image after normalization.
    pub fn matches(&self, other: &Platform) -> bool {
        self.normalize() == other.normalize()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.os.is_empty() {
            return write!(f, "unknown");
        }
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Platform {
    type Err = CimageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn normalize_os(os: &str) -> String {
    let os = os.to_lowercase();
    match os.as_str() {
        "macos" => "darwin".to_string(),
        _ => os,
    }
}

fn normalize_arch(arch: &str, variant: &str) -> (String, String) {
    let arch = arch.to_lowercase();
    let variant = variant.to_lowercase();
    match arch.as_str() {
        "i386" => ("386".to_string(), String::new()),
        "x86_64" | "x86-64" => ("amd64".to_string(), String::new()),
        "aarch64" | "arm64" => {
            let variant = match variant.as_str() {
                "8" | "v8" => String::new(),
                _ => variant,
            };
            ("arm64".to_string(), variant)
        }
        "armhf" => ("arm".to_string(), "v7".to_string()),
        "armel" => ("arm".to_string(), "v6".to_string()),
        "arm" => {
            let variant = match variant.as_str() {
                "" | "7" => "v7".to_string(),
                "5" | "6" | "8" => format!("v{}", variant),
                _ => variant,
            };
            ("arm".to_string(), variant)
        }
        _ => (arch, variant),
    }
}
