//! The worker specification grammar:
//! `[count*]kind[//option=value[,...]]` with
//! kind in `popen`, `ssh=host`, `socket=host:port`.

use std::path::PathBuf;

use crate::error::{ControllerError, Result};

/// How a single worker is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchKind {
    /// Local subprocess sharing the master's filesystem.
    Popen,
    /// Worker started through a remote shell.
    Ssh { host: String },
    /// Worker reachable as a remote socket server.
    Socket { addr: String },
}

/// Parsed description of how to launch one worker. Immutable once
/// parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub kind: LaunchKind,
    /// Working-directory override on the worker's host.
    pub chdir: Option<PathBuf>,
    /// Alternate worker interpreter/executable.
    pub python: Option<PathBuf>,
}

impl WorkerSpec {
    /// Parses one spec string, expanding a leading `count*` replication
    /// prefix into that many identical specs.
    pub fn parse(spec: &str) -> Result<Vec<WorkerSpec>> {
        let (count, rest) = match spec.split_once('*') {
            Some((n, rest)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => {
                let count = n.parse::<usize>().map_err(|e| ControllerError::BadSpec {
                    spec: spec.to_string(),
                    reason: format!("bad replication count: {e}"),
                })?;
                (count, rest)
            }
            _ => (1, spec),
        };

        let parsed = Self::parse_one(rest)?;
        Ok(vec![parsed; count])
    }

    fn parse_one(spec: &str) -> Result<WorkerSpec> {
        let bad = |reason: &str| ControllerError::BadSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (kind_part, opts) = match spec.split_once("//") {
            Some((kind, opts)) => (kind, Some(opts)),
            None => (spec, None),
        };

        let kind = match kind_part.split_once('=') {
            None if kind_part == "popen" => LaunchKind::Popen,
            Some(("ssh", host)) if !host.is_empty() => LaunchKind::Ssh {
                host: host.to_string(),
            },
            Some(("socket", addr)) if !addr.is_empty() => LaunchKind::Socket {
                addr: addr.to_string(),
            },
            _ => return Err(bad("unknown launch kind")),
        };

        let mut parsed = WorkerSpec {
            kind,
            chdir: None,
            python: None,
        };

        if let Some(opts) = opts {
            for opt in opts.split(',') {
                match opt.split_once('=') {
                    Some(("chdir", value)) if !value.is_empty() => {
                        parsed.chdir = Some(PathBuf::from(value));
                    }
                    Some(("python", value)) if !value.is_empty() => {
                        parsed.python = Some(PathBuf::from(value));
                    }
                    _ => return Err(bad(&format!("unknown option {opt:?}"))),
                }
            }
        }

        Ok(parsed)
    }

    /// True when the worker shares the master's filesystem, so no
    /// source material needs to be replicated to it.
    pub fn samefilesystem(&self) -> bool {
        matches!(self.kind, LaunchKind::Popen) && self.chdir.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_popen() {
        let specs = WorkerSpec::parse("popen").unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].kind, LaunchKind::Popen);
        assert!(specs[0].chdir.is_none());
        assert!(specs[0].python.is_none());
    }

    #[test]
    fn count_prefix_replicates() {
        let specs = WorkerSpec::parse("3*popen").unwrap();
        assert_eq!(specs.len(), 3);
        assert!(specs.iter().all(|s| s.kind == LaunchKind::Popen));
    }

    #[test]
    fn parses_ssh_with_options() {
        let specs = WorkerSpec::parse("ssh=noco//chdir=cache,python=/opt/bin/worker").unwrap();
        let spec = &specs[0];
        assert_eq!(
            spec.kind,
            LaunchKind::Ssh {
                host: "noco".to_string()
            }
        );
        assert_eq!(spec.chdir.as_deref(), Some(std::path::Path::new("cache")));
        assert_eq!(
            spec.python.as_deref(),
            Some(std::path::Path::new("/opt/bin/worker"))
        );
    }

    #[test]
    fn parses_socket() {
        let specs = WorkerSpec::parse("socket=host:8888").unwrap();
        assert_eq!(
            specs[0].kind,
            LaunchKind::Socket {
                addr: "host:8888".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(matches!(
            WorkerSpec::parse("teleport=mars"),
            Err(ControllerError::BadSpec { .. })
        ));
    }

    #[test]
    fn rejects_unknown_option() {
        assert!(matches!(
            WorkerSpec::parse("popen//nice=5"),
            Err(ControllerError::BadSpec { .. })
        ));
    }

    #[test]
    fn samefilesystem_only_for_plain_popen() {
        assert!(WorkerSpec::parse("popen").unwrap()[0].samefilesystem());
        assert!(!WorkerSpec::parse("popen//chdir=x").unwrap()[0].samefilesystem());
        assert!(!WorkerSpec::parse("ssh=host").unwrap()[0].samefilesystem());
    }
}
