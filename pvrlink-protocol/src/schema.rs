//! Version-ranged field schemas.
//!
//! Every structured message shape is described by a static [`FieldTable`]:
//! an ordered list of field descriptors, each annotated with the inclusive
//! protocol-version range in which the field is on the wire, an optional
//! fallback version, and an optional pinned wire position. The resolver is
//! pure: the active field set for a `(table, version)` pair is computed
//! fresh on every call and is identical across calls.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::ProtocolError;

/// One field of a message shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Symbolic field identifier.
    pub name: &'static str,
    /// First version carrying the field; `None` = since always.
    pub from: Option<u32>,
    /// Last version carrying the field; `None` = still current.
    pub to: Option<u32>,
    /// Older version whose equivalent encoding substitutes when the active
    /// version falls outside `[from, to]`.
    pub fallback: Option<u32>,
    /// Pinned wire position, overriding declaration order.
    pub position: Option<usize>,
}

impl FieldSpec {
    pub const fn since_always(name: &'static str) -> FieldSpec {
        FieldSpec {
            name,
            from: None,
            to: None,
            fallback: None,
            position: None,
        }
    }

    pub const fn since(name: &'static str, from: u32) -> FieldSpec {
        FieldSpec {
            name,
            from: Some(from),
            to: None,
            fallback: None,
            position: None,
        }
    }

    pub const fn between(name: &'static str, from: u32, to: u32) -> FieldSpec {
        FieldSpec {
            name,
            from: Some(from),
            to: Some(to),
            fallback: None,
            position: None,
        }
    }

    pub const fn with_fallback(mut self, fallback: u32) -> FieldSpec {
        self.fallback = Some(fallback);
        self
    }

    pub const fn pinned(mut self, position: usize) -> FieldSpec {
        self.position = Some(position);
        self
    }

    /// Whether `version` falls inside this field's range.
    pub fn contains(&self, version: u32) -> bool {
        self.from.map_or(true, |from| version >= from)
            && self.to.map_or(true, |to| version <= to)
    }
}

/// A named, ordered message shape.
#[derive(Debug)]
pub struct FieldTable {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl FieldTable {
    /// The ordered subset of fields present at `version`, in wire order:
    /// pinned positions first, declaration order for the rest. A pinned
    /// position collision keeps the first-seen field in place and demotes
    /// the rest to declaration order.
    pub fn active_fields(&self, version: u32) -> Vec<&'static FieldSpec> {
        let active: Vec<&'static FieldSpec> = self
            .fields
            .iter()
            .filter(|f| f.contains(version))
            .collect();

        let mut slots: Vec<Option<&'static FieldSpec>> = vec![None; active.len()];
        let mut unpinned: Vec<&'static FieldSpec> = Vec::new();

        for field in active.iter().copied() {
            match field.position {
                Some(pos) if pos < slots.len() && slots[pos].is_none() => {
                    slots[pos] = Some(field);
                }
                Some(pos) => {
                    log::warn!(
                        "field table {}: position {} of {:?} collides or is out of range, \
                         using declaration order",
                        self.name,
                        pos,
                        field.name
                    );
                    unpinned.push(field);
                }
                None => unpinned.push(field),
            }
        }

        let mut rest = unpinned.into_iter();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = rest.next();
            }
        }
        slots.into_iter().flatten().collect()
    }

    /// Whether `field` is on the wire at `version`.
    pub fn is_supported(&self, field: &str, version: u32) -> bool {
        self.fields
            .iter()
            .any(|f| f.name == field && f.contains(version))
    }

    /// Wire index of `field` at `version`, or `None` when inactive/unknown.
    pub fn resolve_position(&self, field: &str, version: u32) -> Option<usize> {
        self.active_fields(version)
            .iter()
            .position(|f| f.name == field)
    }

    /// Fallback version for `field` when it is not supported at `version`.
    /// Returns `None` when the field is supported (no fallback needed) or
    /// carries no fallback annotation.
    pub fn fallback_for(&self, field: &str, version: u32) -> Option<u32> {
        let spec = self.fields.iter().find(|f| f.name == field)?;
        if spec.contains(version) {
            None
        } else {
            spec.fallback
        }
    }
}

// ── Shipped tables ───────────────────────────────────────────────

/// Fields of a program/recording descriptor.
pub static PROGRAM_INFO: FieldTable = FieldTable {
    name: "program_info",
    fields: &[
        FieldSpec::since_always("title"),
        FieldSpec::since_always("subtitle"),
        FieldSpec::since_always("description"),
        FieldSpec::since("season", 67),
        FieldSpec::since("episode", 67),
        FieldSpec::since("total_episodes", 79),
        FieldSpec::between("syndicated_episode", 77, 87),
        FieldSpec::since_always("category"),
        FieldSpec::since_always("chan_id"),
        FieldSpec::since_always("chan_num"),
        FieldSpec::since_always("callsign"),
        FieldSpec::since_always("chan_name"),
        FieldSpec::since_always("filename"),
        FieldSpec::since_always("file_size"),
        FieldSpec::since_always("start_ts"),
        FieldSpec::since_always("end_ts"),
        FieldSpec::since("inetref", 67),
        FieldSpec::between("stars", 56, 78).with_fallback(56),
        FieldSpec::since_always("rec_status"),
        FieldSpec::since_always("rec_group"),
    ],
};

/// Fields of a recorder descriptor.
pub static RECORDER_INFO: FieldTable = FieldTable {
    name: "recorder_info",
    fields: &[
        FieldSpec::since_always("recorder_id").pinned(0),
        FieldSpec::since_always("hostname"),
        FieldSpec::since_always("port"),
        FieldSpec::since("input_name", 58),
        FieldSpec::since("source_id", 58),
        FieldSpec::between("card_type", 56, 87),
        FieldSpec::since("live_tv_order", 71),
    ],
};

/// Fields of the `ANN FileTransfer` announce frame, in wire order per
/// version. `retries` was replaced by `timeout_ms` at 60; `write_mode`
/// arrived with the wide-integer revision; `storage_group` at 58.
pub static ANN_FILE_TRANSFER: FieldTable = FieldTable {
    name: "ann_file_transfer",
    fields: &[
        FieldSpec::since_always("announce").pinned(0),
        FieldSpec::since("write_mode", 66),
        FieldSpec::since_always("use_read_ahead"),
        FieldSpec::between("retries", 56, 59).with_fallback(56),
        FieldSpec::since("timeout_ms", 60),
        FieldSpec::since_always("target"),
        FieldSpec::since("storage_group", 58),
    ],
};

static TABLES: Lazy<HashMap<&'static str, &'static FieldTable>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, &'static FieldTable> = HashMap::new();
    for table in [&PROGRAM_INFO, &RECORDER_INFO, &ANN_FILE_TRANSFER] {
        map.insert(table.name, table);
    }
    map
});

/// Look up a registered field table by name.
pub fn lookup_table(name: &str) -> Result<&'static FieldTable, ProtocolError> {
    TABLES
        .get(name)
        .copied()
        .ok_or_else(|| ProtocolError::SchemaError {
            kind: "field table",
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_boundaries_inclusive() {
        let spec = FieldSpec::between("syndicated_episode", 77, 87);
        assert!(!spec.contains(76));
        assert!(spec.contains(77));
        assert!(spec.contains(87));
        assert!(!spec.contains(88));
    }

    #[test]
    fn test_is_supported_monotonic_at_edges() {
        // range [17, 60] shape, on a synthetic table
        static T: FieldTable = FieldTable {
            name: "t",
            fields: &[FieldSpec::between("x", 17, 60)],
        };
        assert!(!T.is_supported("x", 16));
        assert!(T.is_supported("x", 17));
        assert!(T.is_supported("x", 60));
        assert!(!T.is_supported("x", 61));
    }

    #[test]
    fn test_active_fields_adjacent_versions_differ_by_boundary_fields() {
        let at_66 = PROGRAM_INFO.active_fields(66);
        let at_67 = PROGRAM_INFO.active_fields(67);
        let names_66: Vec<_> = at_66.iter().map(|f| f.name).collect();
        let names_67: Vec<_> = at_67.iter().map(|f| f.name).collect();

        let added: Vec<_> = names_67
            .iter()
            .filter(|n| !names_66.contains(n))
            .copied()
            .collect();
        let removed: Vec<_> = names_66
            .iter()
            .filter(|n| !names_67.contains(n))
            .copied()
            .collect();
        assert_eq!(added, vec!["season", "episode", "inetref"]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let a = PROGRAM_INFO.active_fields(77);
        let b = PROGRAM_INFO.active_fields(77);
        assert_eq!(a, b);
    }

    #[test]
    fn test_pinned_position_kept() {
        let active = RECORDER_INFO.active_fields(91);
        assert_eq!(active[0].name, "recorder_id");
        assert_eq!(RECORDER_INFO.resolve_position("recorder_id", 91), Some(0));
    }

    #[test]
    fn test_position_collision_keeps_first_seen() {
        static T: FieldTable = FieldTable {
            name: "collide",
            fields: &[
                FieldSpec {
                    name: "a",
                    from: None,
                    to: None,
                    fallback: None,
                    position: Some(0),
                },
                FieldSpec {
                    name: "b",
                    from: None,
                    to: None,
                    fallback: None,
                    position: Some(0),
                },
            ],
        };
        let active = T.active_fields(77);
        assert_eq!(active[0].name, "a");
        assert_eq!(active[1].name, "b");
    }

    #[test]
    fn test_resolve_position_shifts_with_version() {
        // Below 60 the announce frame carries `retries`; at 60+ it carries
        // `timeout_ms` in the same slot.
        assert_eq!(
            ANN_FILE_TRANSFER.resolve_position("retries", 58),
            ANN_FILE_TRANSFER.resolve_position("timeout_ms", 60),
        );
        assert_eq!(ANN_FILE_TRANSFER.resolve_position("retries", 60), None);
        // write_mode insertion at 66 shifts everything after it
        let pos_before = ANN_FILE_TRANSFER
            .resolve_position("target", 60)
            .unwrap();
        let pos_after = ANN_FILE_TRANSFER
            .resolve_position("target", 66)
            .unwrap();
        assert_eq!(pos_after, pos_before + 1);
    }

    #[test]
    fn test_fallback_only_when_unsupported() {
        assert_eq!(ANN_FILE_TRANSFER.fallback_for("retries", 58), None);
        assert_eq!(ANN_FILE_TRANSFER.fallback_for("retries", 77), Some(56));
        assert_eq!(ANN_FILE_TRANSFER.fallback_for("no_such_field", 77), None);
    }

    #[test]
    fn test_out_of_range_version_yields_empty_set() {
        static T: FieldTable = FieldTable {
            name: "narrow",
            fields: &[FieldSpec::between("x", 70, 75)],
        };
        assert!(T.active_fields(56).is_empty());
    }

    #[test]
    fn test_unknown_table() {
        assert!(matches!(
            lookup_table("no_such_table"),
            Err(ProtocolError::SchemaError { .. })
        ));
        assert!(lookup_table("program_info").is_ok());
    }
}
