//! Host SELinux mode detection.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelinuxMode {
    Enforcing,
    Permissive,
    Disabled,
    Unknown,
}

impl SelinuxMode {
    pub fn is_enforcing(self) -> bool {
        self == Self::Enforcing
    }
}

impl fmt::Display for SelinuxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Enforcing => "enforcing",
            Self::Permissive => "permissive",
            Self::Disabled => "disabled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

pub trait SelinuxProbe: Send + Sync {
    fn mode(&self) -> SelinuxMode;
}

/// Reads `/sys/fs/selinux/enforce`. Always `Disabled` off Linux.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSelinuxProbe;

impl SelinuxProbe for HostSelinuxProbe {
    #[cfg(target_os = "linux")]
    fn mode(&self) -> SelinuxMode {
        match std::fs::read_to_string("/sys/fs/selinux/enforce") {
            Ok(content) => parse_enforce(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SelinuxMode::Disabled,
            Err(e) => {
                tracing::debug!("cannot read SELinux enforce flag: {e}");
                SelinuxMode::Unknown
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn mode(&self) -> SelinuxMode {
        SelinuxMode::Disabled
    }
}

/// A probe that always reports the same mode.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelinuxProbe(pub SelinuxMode);

impl SelinuxProbe for FixedSelinuxProbe {
    fn mode(&self) -> SelinuxMode {
        self.0
    }
}

fn parse_enforce(content: &str) -> SelinuxMode {
    match content.trim() {
        "1" => SelinuxMode::Enforcing,
        "0" => SelinuxMode::Permissive,
        _ => SelinuxMode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforce_file_contents() {
        assert_eq!(parse_enforce("1\n"), SelinuxMode::Enforcing);
        assert_eq!(parse_enforce("0"), SelinuxMode::Permissive);
        assert_eq!(parse_enforce("garbage"), SelinuxMode::Unknown);
    }

    #[test]
    fn fixed_probe() {
        assert!(FixedSelinuxProbe(SelinuxMode::Enforcing).mode().is_enforcing());
        assert!(!FixedSelinuxProbe(SelinuxMode::Permissive).mode().is_enforcing());
    }

    #[test]
    fn host_probe_does_not_panic() {
        let _ = HostSelinuxProbe.mode();
    }
}
