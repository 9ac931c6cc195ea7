//! Replays container-runtime `runArgs` onto overlay fields.
//!
//! Flags are looked up in a single table mapping names to a setter. Setters
//! taking a value accept both `--flag=value` and `--flag value`.
//! Unrecognized flags are skipped.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// A compose ulimit: one value for both limits, or a soft/hard pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Ulimit {
    Single(i64),
    Range { soft: i64, hard: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub devices: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub tmpfs: Vec<String>,
    pub ports: Vec<String>,
    pub network_mode: Option<String>,
    pub ipc: Option<String>,
    pub pid: Option<String>,
    pub shm_size: Option<String>,
    pub privileged: bool,
    pub init: bool,
    pub sysctls: BTreeMap<String, String>,
    pub ulimits: BTreeMap<String, Ulimit>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Copy)]
enum Setter {
    /// Boolean flag; an explicit `=false` clears it.
    Flag(fn(&mut RunArgs, bool)),
    /// Flag taking exactly one argument.
    Value(fn(&mut RunArgs, &str)),
}

struct FlagSpec {
    names: &'static [&'static str],
    setter: Setter,
}

static FLAGS: &[FlagSpec] = &[
    FlagSpec {
        names: &["--cap-add"],
        setter: Setter::Value(|r, v| r.cap_add.push(v.to_owned())),
    },
    FlagSpec {
        names: &["--cap-drop"],
        setter: Setter::Value(|r, v| r.cap_drop.push(v.to_owned())),
    },
    FlagSpec {
        names: &["--security-opt"],
        setter: Setter::Value(|r, v| r.security_opt.push(v.to_owned())),
    },
    FlagSpec {
        names: &["--device"],
        setter: Setter::Value(|r, v| r.devices.push(v.to_owned())),
    },
    FlagSpec {
        names: &["--add-host"],
        setter: Setter::Value(|r, v| r.extra_hosts.push(v.to_owned())),
    },
    FlagSpec {
        names: &["--tmpfs"],
        setter: Setter::Value(|r, v| r.tmpfs.push(v.to_owned())),
    },
    FlagSpec {
        names: &["-p", "--publish"],
        setter: Setter::Value(|r, v| r.ports.push(v.to_owned())),
    },
    FlagSpec {
        names: &["--network", "--net"],
        setter: Setter::Value(|r, v| r.network_mode = Some(v.to_owned())),
    },
    FlagSpec {
        names: &["--ipc"],
        setter: Setter::Value(|r, v| r.ipc = Some(v.to_owned())),
    },
    FlagSpec {
        names: &["--pid"],
        setter: Setter::Value(|r, v| r.pid = Some(v.to_owned())),
    },
    FlagSpec {
        names: &["--shm-size"],
        setter: Setter::Value(|r, v| r.shm_size = Some(v.to_owned())),
    },
    FlagSpec {
        names: &["--privileged"],
        setter: Setter::Flag(|r, on| r.privileged = on),
    },
    FlagSpec {
        names: &["--init"],
        setter: Setter::Flag(|r, on| r.init = on),
    },
    FlagSpec {
        names: &["--sysctl"],
        setter: Setter::Value(|r, v| {
            if let Some((k, val)) = split_pair(v) {
                r.sysctls.insert(k, val);
            }
        }),
    },
    FlagSpec {
        names: &["--ulimit"],
        setter: Setter::Value(|r, v| {
            if let Some((name, limit)) = parse_ulimit(v) {
                r.ulimits.insert(name, limit);
            }
        }),
    },
    FlagSpec {
        names: &["-l", "--label"],
        setter: Setter::Value(|r, v| {
            let (k, val) = v.split_once('=').unwrap_or((v, ""));
            if !k.is_empty() {
                r.labels.insert(k.to_owned(), val.to_owned());
            }
        }),
    },
];

fn lookup(name: &str) -> Option<Setter> {
    FLAGS
        .iter()
        .find(|spec| spec.names.contains(&name))
        .map(|spec| spec.setter)
}

pub fn parse_run_args(args: &[String]) -> RunArgs {
    let mut out = RunArgs::default();
    let mut tokens = args.iter().peekable();
    while let Some(token) = tokens.next() {
        if !token.starts_with('-') {
            debug!("runArgs: ignoring positional '{token}'");
            continue;
        }
        let (name, inline) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (token.as_str(), None),
        };
        match lookup(name) {
            Some(Setter::Flag(set)) => {
                set(&mut out, !matches!(inline, Some("false" | "0")));
            }
            Some(Setter::Value(set)) => {
                let value = match inline {
                    Some(v) => Some(v),
                    None => tokens.next_if(|next| !next.starts_with('-')).map(String::as_str),
                };
                match value {
                    Some(v) => set(&mut out, v),
                    None => debug!("runArgs: '{name}' is missing its value"),
                }
            }
            None => debug!("runArgs: ignoring unrecognized flag '{name}'"),
        }
    }
    out
}

fn split_pair(v: &str) -> Option<(String, String)> {
    let (k, val) = v.split_once('=')?;
    let k = k.trim();
    (!k.is_empty()).then(|| (k.to_owned(), val.trim().to_owned()))
}

/// `name=soft[:hard]`
fn parse_ulimit(v: &str) -> Option<(String, Ulimit)> {
    let (name, limits) = split_pair(v)?;
    let limit = match limits.split_once(':') {
        Some((soft, hard)) => Ulimit::Range {
            soft: soft.parse().ok()?,
            hard: hard.parse().ok()?,
        },
        None => Ulimit::Single(limits.parse().ok()?),
    };
    Some((name, limit))
}
