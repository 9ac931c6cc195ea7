//! Parser for devcontainer-style mount strings.
//!
//! Accepts `source=..,target=..,type=..` with the aliases `src`, `dst` and
//! `destination`, plus a bare `readonly`/`ro` flag. The result renders in the
//! compose short volume syntax.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
    /// Append the SELinux private relabel option (`Z`). Only meaningful for binds.
    pub relabel: bool,
}

impl MountEntry {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
            relabel: false,
        }
    }

    /// Request relabeling when SELinux is enforcing. No-op for non-bind mounts.
    #[must_use]
    pub fn with_relabel(mut self, enforcing: bool) -> Self {
        self.relabel = enforcing && self.kind == MountKind::Bind;
        self
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MountKind::Tmpfs => write!(f, "tmpfs:{}", self.target),
            MountKind::Bind | MountKind::Volume => {
                write!(f, "{}:{}", self.source, self.target)?;
                let mut opts = Vec::new();
                if self.read_only {
                    opts.push("ro");
                }
                if self.relabel {
                    opts.push("Z");
                }
                if !opts.is_empty() {
                    write!(f, ":{}", opts.join(","))?;
                }
                Ok(())
            }
        }
    }
}

/// Parse one mount string. Returns `None` for anything unparseable or incomplete.
pub fn parse_mount(spec: &str) -> Option<MountEntry> {
    let mut source = None;
    let mut target = None;
    let mut kind = MountKind::Bind;
    let mut read_only = false;

    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim())),
            None => (part.to_ascii_lowercase(), None),
        };
        match (key.as_str(), value) {
            ("source" | "src", Some(v)) => source = Some(v.to_owned()),
            ("target" | "dst" | "destination", Some(v)) => target = Some(v.to_owned()),
            ("type", Some(v)) => {
                kind = match v.to_ascii_lowercase().as_str() {
                    "bind" => MountKind::Bind,
                    "volume" => MountKind::Volume,
                    "tmpfs" => MountKind::Tmpfs,
                    _ => return None,
                };
            }
            ("readonly" | "ro", None) => read_only = true,
            ("readonly" | "ro", Some(v)) => read_only = matches!(v, "true" | "1"),
            _ => {}
        }
    }

    let target = target.filter(|t| t.starts_with('/'))?;
    let source = match kind {
        MountKind::Tmpfs => String::new(),
        MountKind::Bind | MountKind::Volume => source.filter(|s| !s.is_empty())?,
    };

    Some(MountEntry {
        kind,
        source,
        target,
        read_only,
        relabel: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(spec: &str) -> Option<String> {
        parse_mount(spec).map(|m| m.to_string())
    }

    #[test]
    fn bind_mount() {
        assert_eq!(
            render("source=/host/path,target=/container/path,type=bind").as_deref(),
            Some("/host/path:/container/path")
        );
    }

    #[test]
    fn volume_mount() {
        assert_eq!(
            render("source=myvolume,target=/data,type=volume").as_deref(),
            Some("myvolume:/data")
        );
    }

    #[test]
    fn tmpfs_mount() {
        assert_eq!(render("target=/tmp,type=tmpfs").as_deref(), Some("tmpfs:/tmp"));
    }

    #[test]
    fn type_defaults_to_bind() {
        let m = parse_mount("source=/a,target=/b").unwrap();
        assert_eq!(m.kind, MountKind::Bind);
        assert_eq!(m.to_string(), "/a:/b");
    }

    #[test]
    fn aliases_are_accepted() {
        assert_eq!(render("src=/a,dst=/b").as_deref(), Some("/a:/b"));
        assert_eq!(render("src=/a,destination=/b").as_deref(), Some("/a:/b"));
        assert_eq!(render("Source=/a,Target=/b,Type=BIND").as_deref(), Some("/a:/b"));
    }

    #[test]
    fn relabel_only_applies_to_binds() {
        let bind = parse_mount("source=/a,target=/b").unwrap().with_relabel(true);
        assert_eq!(bind.to_string(), "/a:/b:Z");
        let vol = parse_mount("source=v,target=/b,type=volume")
            .unwrap()
            .with_relabel(true);
        assert_eq!(vol.to_string(), "v:/b");
        let off = parse_mount("source=/a,target=/b").unwrap().with_relabel(false);
        assert_eq!(off.to_string(), "/a:/b");
    }

    #[test]
    fn readonly_flag() {
        assert_eq!(
            render("source=/a,target=/b,readonly").as_deref(),
            Some("/a:/b:ro")
        );
        let m = parse_mount("source=/a,target=/b,ro").unwrap().with_relabel(true);
        assert_eq!(m.to_string(), "/a:/b:ro,Z");
    }

    #[test]
    fn incomplete_entries_are_rejected() {
        assert!(parse_mount("").is_none());
        assert!(parse_mount("target=/b").is_none());
        assert!(parse_mount("source=/a").is_none());
        assert!(parse_mount("source=/a,target=relative").is_none());
        assert!(parse_mount("source=/a,target=/b,type=npipe").is_none());
        assert!(parse_mount("garbage").is_none());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        assert_eq!(
            render("source=/a,target=/b,consistency=cached").as_deref(),
            Some("/a:/b")
        );
    }
}
