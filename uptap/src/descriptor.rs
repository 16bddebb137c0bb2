// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Probe descriptors: which symbol to tap, and how to turn the call's
//! arguments into one event record.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::EventSchema;

/// Number of integer argument slots a probe can reference. Matches the
/// registers the System V ABIs pass the first arguments in on x86_64 and
/// aarch64.
pub const MAX_ARG_SLOTS: u8 = 6;

/// Bytes one argument slot carries.
const SLOT_WIDTH: usize = 8;

/// Where one event field's bytes come from when the probed call fires.
///
/// Slots are 1-based call positions: slot 1 is the first argument of the
/// probed function as written in its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSource {
    /// The argument value itself, truncated to the field width.
    Slot(u8),
    /// The argument is a pointer; read the field's bytes from
    /// `*(arg + offset)` in the probed process.
    Deref { slot: u8, offset: u32 },
}

impl ArgSource {
    fn slot(self) -> u8 {
        match self {
            ArgSource::Slot(slot) => slot,
            ArgSource::Deref { slot, .. } => slot,
        }
    }
}

/// A validated description of one probe: the library and symbol to attach
/// to, plus one extraction rule per schema field.
#[derive(Debug, Clone)]
pub struct ProbeDescriptor {
    schema: Arc<EventSchema>,
    target: PathBuf,
    symbol: String,
    rules: Vec<ArgSource>,
}

impl ProbeDescriptor {
    /// Validates the pieces and builds a descriptor. The schema's fields and
    /// `rules` pair up in order, so their counts must match; every rule must
    /// reference a slot in `1..=MAX_ARG_SLOTS`; a `Slot` rule cannot feed a
    /// field wider than the slot itself.
    pub fn describe<P: AsRef<Path>>(
        schema: EventSchema,
        target: P,
        symbol: &str,
        rules: &[ArgSource],
    ) -> Result<ProbeDescriptor> {
        let target = target.as_ref();
        if symbol.is_empty() {
            return Err(Error::InvalidDescriptor("empty symbol name".to_string()));
        }
        if target.as_os_str().is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "symbol `{}` has no target library",
                symbol
            )));
        }
        if rules.len() != schema.fields().len() {
            return Err(Error::InvalidDescriptor(format!(
                "schema `{}` has {} fields but {} extraction rules",
                schema.name(),
                schema.fields().len(),
                rules.len()
            )));
        }
        for (field, rule) in schema.fields().iter().zip(rules) {
            let slot = rule.slot();
            if slot == 0 || slot > MAX_ARG_SLOTS {
                return Err(Error::InvalidDescriptor(format!(
                    "field `{}` reads argument slot {}, valid slots are 1..={}",
                    field.name(),
                    slot,
                    MAX_ARG_SLOTS
                )));
            }
            if let ArgSource::Slot(_) = rule {
                if field.kind().width() > SLOT_WIDTH {
                    return Err(Error::InvalidDescriptor(format!(
                        "field `{}` is wider than an argument slot",
                        field.name()
                    )));
                }
            }
        }
        Ok(ProbeDescriptor {
            schema: Arc::new(schema),
            target: target.to_path_buf(),
            symbol: symbol.to_string(),
            rules: rules.to_vec(),
        })
    }

    pub fn schema(&self) -> &Arc<EventSchema> {
        &self.schema
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn rules(&self) -> &[ArgSource] {
        &self.rules
    }

    /// `symbol@target`, the name probes are logged and reported under.
    pub fn probe_name(&self) -> String {
        format!("{}@{}", self.symbol, self.target.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    fn truncate_schema() -> EventSchema {
        EventSchema::new("truncate", &[("id", FieldKind::I32)])
    }

    #[test]
    fn describe_accepts_matching_rules() {
        let d = ProbeDescriptor::describe(
            truncate_schema(),
            "./libjpaxos-pmem.so",
            "Java_lsr_paxos_storage_PersistentLog_truncateBelow_1",
            &[ArgSource::Slot(3)],
        )
        .unwrap();
        assert_eq!(d.rules(), &[ArgSource::Slot(3)]);
        assert_eq!(
            d.probe_name(),
            "Java_lsr_paxos_storage_PersistentLog_truncateBelow_1@./libjpaxos-pmem.so"
        );
    }

    #[test]
    fn describe_accepts_zero_field_schemas() {
        let d = ProbeDescriptor::describe(EventSchema::new("hit", &[]), "lib.so", "f", &[]);
        assert!(d.is_ok());
    }

    #[test]
    fn describe_rejects_rule_count_mismatch() {
        let err = ProbeDescriptor::describe(truncate_schema(), "lib.so", "f", &[]);
        assert!(matches!(err, Err(Error::InvalidDescriptor(_))));
        let err = ProbeDescriptor::describe(
            truncate_schema(),
            "lib.so",
            "f",
            &[ArgSource::Slot(1), ArgSource::Slot(2)],
        );
        assert!(matches!(err, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn describe_rejects_out_of_range_slots() {
        for rule in [
            ArgSource::Slot(0),
            ArgSource::Slot(MAX_ARG_SLOTS + 1),
            ArgSource::Deref { slot: 0, offset: 0 },
            ArgSource::Deref {
                slot: MAX_ARG_SLOTS + 1,
                offset: 4,
            },
        ] {
            let err = ProbeDescriptor::describe(truncate_schema(), "lib.so", "f", &[rule]);
            assert!(matches!(err, Err(Error::InvalidDescriptor(_))), "{:?}", rule);
        }
    }

    #[test]
    fn describe_rejects_empty_names() {
        assert!(matches!(
            ProbeDescriptor::describe(truncate_schema(), "lib.so", "", &[ArgSource::Slot(1)]),
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(matches!(
            ProbeDescriptor::describe(truncate_schema(), "", "f", &[ArgSource::Slot(1)]),
            Err(Error::InvalidDescriptor(_))
        ));
    }
}
