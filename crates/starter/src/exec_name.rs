//! Resolving the executable name the authority hands out into a local path
//! or a name to fetch over the channel.

use std::collections::BTreeMap;
use std::path::PathBuf;

use nix::unistd::{AccessFlags, access};
use tracing::debug;

use crate::config::StarterConfig;
use crate::error::{StarterError, StarterResult};

/// Paths under this prefix are visible on every execute machine.
const SHARED_FS_PREFIX: &str = "/afs/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecLocation {
    /// Usable in place on this machine.
    Local(PathBuf),
    /// Must be fetched from the submit side.
    Remote(String),
}

/// Expand `$(NAME)` references from `macros`. An unterminated reference is
/// kept as written; an undefined one is an error.
pub fn expand_macros(s: &str, macros: &BTreeMap<String, String>) -> StarterResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("$(") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let body = tail.get(2..).unwrap_or_default();
        let Some(end) = body.find(')') else {
            out.push_str(tail);
            return Ok(out);
        };
        let name = body.get(..end).unwrap_or_default();
        let value = macros
            .get(name)
            .ok_or_else(|| StarterError::JobAd(format!("undefined macro $({name}) in {s}")))?;
        out.push_str(value);
        rest = body.get(end + 1..).unwrap_or_default();
    }
    out.push_str(rest);
    Ok(out)
}

/// `host:path` when the part before the first `:` names a host.
fn split_host(name: &str) -> Option<(&str, &str)> {
    let (host, path) = name.split_once(':')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some((host, path))
}

/// Decide where the executable comes from.
///
/// * `host:path` is local when `host` is this machine and remote when it is
///   the initiating host; any other host is an error.
/// * Bare paths are local under the shared filesystem and remote otherwise.
/// * A local path that is not executable here is fetched instead.
pub fn resolve(name: &str, config: &StarterConfig) -> StarterResult<ExecLocation> {
    let location = match split_host(name) {
        Some((host, path)) => {
            let path = expand_macros(path, &config.macros)?;
            if host.eq_ignore_ascii_case(&config.this_host()) {
                ExecLocation::Local(PathBuf::from(path))
            } else if config
                .initiating_host
                .as_deref()
                .is_some_and(|h| host.eq_ignore_ascii_case(h))
            {
                ExecLocation::Remote(path)
            } else {
                return Err(StarterError::JobAd(format!(
                    "executable {name} names unknown host {host}"
                )));
            }
        }
        None => {
            let path = expand_macros(name, &config.macros)?;
            if path.starts_with(SHARED_FS_PREFIX) {
                ExecLocation::Local(PathBuf::from(path))
            } else {
                ExecLocation::Remote(path)
            }
        }
    };

    if let ExecLocation::Local(path) = &location
        && access(path.as_path(), AccessFlags::X_OK).is_err()
    {
        debug!(path = %path.display(), "local executable not usable, fetching instead");
        return Ok(ExecLocation::Remote(path.display().to_string()));
    }
    Ok(location)
}
