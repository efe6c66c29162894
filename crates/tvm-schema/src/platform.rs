//! Host platform identification.
//!
//! Toolchain archives are published per operating system and CPU architecture.
//! The naming follows the upstream distribution (`linux`, `darwin`, `windows`
//! and `386`, `amd64`, `arm64`, `armv6l`), which is not always what
//! `std::env::consts` reports, so parsing accepts the common aliases.

use serde::{Deserialize, Serialize};

/// Operating system family a toolchain archive is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Linux distributions.
    Linux,
    /// macOS (Apple's kernel name is used in archive names).
    Darwin,
    /// Microsoft Windows.
    Windows,
}

impl Os {
    /// Name as used in archive filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        }
    }

    /// Returns `true` for Windows, where executables carry an `.exe` suffix.
    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Windows)
    }
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Os {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "darwin" | "macos" | "osx" => Ok(Self::Darwin),
            "windows" | "win" | "win32" => Ok(Self::Windows),
            _ => Err(PlatformError::UnknownOs(s.to_string())),
        }
    }
}

/// CPU architecture a toolchain archive is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 64-bit x86 (`x86_64`).
    Amd64,
    /// 64-bit ARM (`aarch64`).
    Arm64,
    /// 32-bit ARM (hard float, v6 baseline).
    Armv6l,
}

impl Arch {
    /// Name as used in archive filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86 => "386",
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Armv6l => "armv6l",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Arch {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "386" | "x86" | "i386" | "i686" => Ok(Self::X86),
            "amd64" | "x86_64" | "x64" => Ok(Self::Amd64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "armv6l" | "arm" | "armv7l" => Ok(Self::Armv6l),
            _ => Err(PlatformError::UnknownArch(s.to_string())),
        }
    }
}

/// Errors produced while identifying a platform.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The operating system name is not one of the supported families.
    #[error("Unknown operating system: {0}")]
    UnknownOs(String),

    /// The architecture name is not recognized.
    #[error("Unknown architecture: {0}")]
    UnknownArch(String),
}

/// An (operating system, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system family.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
}

impl Platform {
    /// Create a platform from its parts.
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Detect the platform this binary was compiled for.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when running on an OS or CPU the upstream
    /// distribution does not publish archives for.
    pub fn current() -> Result<Self, PlatformError> {
        Ok(Self {
            os: std::env::consts::OS.parse()?,
            arch: std::env::consts::ARCH.parse()?,
        })
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("macos".parse::<Os>().unwrap(), Os::Darwin);
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::Amd64);
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert_eq!("i686".parse::<Arch>().unwrap(), Arch::X86);
    }

    #[test]
    fn rejects_unknown() {
        assert!("plan9".parse::<Os>().is_err());
        assert!("riscv64".parse::<Arch>().is_err());
    }

    #[test]
    fn display_matches_archive_naming() {
        let p = Platform::new(Os::Linux, Arch::Amd64);
        assert_eq!(p.to_string(), "linux-amd64");
    }
}
