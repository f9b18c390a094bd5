//! Command registry: which backend commands exist, and in which protocol
//! version range each one is accepted.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{ClientError, ProtocolError};
use crate::types::{CMD_ANN, CMD_DONE, CMD_PROTO_VERSION};

/// One backend command and its supported version range.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// First version accepting the command; `None` = since always.
    pub from: Option<u32>,
    /// Last version accepting the command; `None` = still current.
    pub to: Option<u32>,
    /// Version whose equivalent command should be used instead when the
    /// negotiated version is outside the range.
    pub fallback: Option<u32>,
}

impl CommandSpec {
    const fn always(name: &'static str) -> CommandSpec {
        CommandSpec {
            name,
            from: None,
            to: None,
            fallback: None,
        }
    }

    const fn since(name: &'static str, from: u32) -> CommandSpec {
        CommandSpec {
            name,
            from: Some(from),
            to: None,
            fallback: None,
        }
    }

    const fn between(name: &'static str, from: u32, to: u32, fallback: Option<u32>) -> CommandSpec {
        CommandSpec {
            name,
            from: Some(from),
            to: Some(to),
            fallback,
        }
    }

    pub fn supports(&self, version: u32) -> bool {
        self.from.map_or(true, |from| version >= from)
            && self.to.map_or(true, |to| version <= to)
    }
}

/// Commands allowed before the connection has been announced.
pub const PRE_ANNOUNCE_COMMANDS: &[&str] = &[CMD_PROTO_VERSION, CMD_ANN, CMD_DONE];

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::always(CMD_PROTO_VERSION),
    CommandSpec::always(CMD_ANN),
    CommandSpec::always(CMD_DONE),
    CommandSpec::always("MESSAGE"),
    CommandSpec::always("QUERY_RECORDINGS"),
    CommandSpec::always("QUERY_GETALLPENDING"),
    CommandSpec::always("QUERY_BOOKMARK"),
    CommandSpec::always("SET_BOOKMARK"),
    CommandSpec::always("FORGET_RECORDING"),
    CommandSpec::always("DELETE_RECORDING"),
    CommandSpec::always("QUERY_FILETRANSFER"),
    CommandSpec::always("REFRESH_BACKEND"),
    CommandSpec::always("SHUTDOWN_NOW"),
    CommandSpec::between("QUERY_FREE_SPACE", 56, 65, None),
    // Summary form replaced the per-host query; callers on older backends
    // fall back to the 65 encoding.
    CommandSpec {
        name: "QUERY_FREE_SPACE_SUMMARY",
        from: Some(66),
        to: None,
        fallback: Some(65),
    },
    CommandSpec::since("UNDELETE_RECORDING", 59),
    CommandSpec::since("QUERY_PIXMAP_GETIFMODIFIED", 61),
    CommandSpec::since("QUERY_TIME_ZONE", 62),
    CommandSpec::since("SCAN_VIDEOS", 64),
    CommandSpec::since("QUERY_ACTIVE_BACKENDS", 72),
    CommandSpec::since("QUERY_SG_FILEQUERY", 58),
    CommandSpec::since("GO_TO_SLEEP", 62),
];

static REGISTRY: Lazy<HashMap<&'static str, &'static CommandSpec>> = Lazy::new(|| {
    COMMANDS.iter().map(|c| (c.name, c)).collect()
});

/// Look up a command by name.
pub fn lookup(name: &str) -> Result<&'static CommandSpec, ProtocolError> {
    REGISTRY
        .get(name)
        .copied()
        .ok_or_else(|| ProtocolError::SchemaError {
            kind: "command",
            name: name.to_string(),
        })
}

/// Whether `name` may be written before the announce handshake.
pub fn allowed_before_announce(name: &str) -> bool {
    PRE_ANNOUNCE_COMMANDS.contains(&name)
}

/// Gate `name` against `version`: `Ok` when supported, `UnsupportedCommand`
/// (carrying the valid range) when the version falls outside the command's
/// range, `SchemaError` when the command is unknown.
pub fn check_supported(name: &str, version: u32) -> Result<(), ClientError> {
    let spec = lookup(name)?;
    if spec.supports(version) {
        Ok(())
    } else {
        Err(ClientError::UnsupportedCommand {
            command: name.to_string(),
            version,
            from: spec.from.unwrap_or(0),
            to: spec.to,
        })
    }
}

/// Fallback version for `name` at `version`, when one is declared and the
/// command is unsupported there. The caller re-issues the older equivalent
/// built for the returned version; the registry never retries on its own.
pub fn fallback(name: &str, version: u32) -> Result<Option<u32>, ProtocolError> {
    let spec = lookup(name)?;
    if spec.supports(version) {
        Ok(None)
    } else {
        Ok(spec.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_supported() {
        assert!(check_supported("QUERY_RECORDINGS", 56).is_ok());
        assert!(check_supported("QUERY_RECORDINGS", 91).is_ok());
    }

    #[test]
    fn test_range_gating() {
        assert!(check_supported("QUERY_ACTIVE_BACKENDS", 72).is_ok());
        let err = check_supported("QUERY_ACTIVE_BACKENDS", 71).unwrap_err();
        match err {
            ClientError::UnsupportedCommand { from, to, .. } => {
                assert_eq!(from, 72);
                assert_eq!(to, None);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(check_supported("QUERY_FREE_SPACE", 65).is_ok());
        assert!(check_supported("QUERY_FREE_SPACE", 66).is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            check_supported("NOT_A_COMMAND", 77),
            Err(ClientError::Protocol(ProtocolError::SchemaError { .. }))
        ));
    }

    #[test]
    fn test_fallback() {
        // Summary query on an old backend points at the legacy encoding
        assert_eq!(fallback("QUERY_FREE_SPACE_SUMMARY", 60).unwrap(), Some(65));
        // Supported version needs no fallback
        assert_eq!(fallback("QUERY_FREE_SPACE_SUMMARY", 77).unwrap(), None);
    }

    #[test]
    fn test_pre_announce_allow_list() {
        assert!(allowed_before_announce("PROTO_VERSION"));
        assert!(allowed_before_announce("ANN"));
        assert!(allowed_before_announce("DONE"));
        assert!(!allowed_before_announce("QUERY_RECORDINGS"));
    }
}
