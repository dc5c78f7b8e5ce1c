//! Schema-framed snapshot serialization
//!
//! The committed snapshot is stored as one fragment per schema, so a DDL
//! touching two schemas rewrites two values and nothing else. A reader
//! accumulates fragments (staged before primary, first occurrence wins)
//! and `finish` resolves them into a validated snapshot. Generations are
//! never part of a fragment; the registry assigns them separately.

use serde::{Deserialize, Serialize};

use crate::ais::{
    Ais, Schema, INFORMATION_SCHEMA, SECURITY_SCHEMA, SQLJ_SCHEMA, SYS_SCHEMA,
};
use crate::error::{Error, Result};

/// Which elements of a snapshot a serialization includes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteSelector {
    /// Every schema, unfiltered.
    All,
    /// One schema, unfiltered.
    Schema(String),
    /// One schema with memory tables left out.
    SchemaNoMemoryTables(String),
    /// One schema with routines left out.
    SchemaNoRoutines(String),
}

/// The selector the persistence path uses for a schema: catalog schemas
/// drop their memory tables, routine schemas drop their re-registered
/// routines, everything else persists whole.
pub fn selector_for_schema(name: &str) -> WriteSelector {
    match name {
        INFORMATION_SCHEMA | SECURITY_SCHEMA => {
            WriteSelector::SchemaNoMemoryTables(name.to_string())
        }
        SYS_SCHEMA | SQLJ_SCHEMA => WriteSelector::SchemaNoRoutines(name.to_string()),
        _ => WriteSelector::Schema(name.to_string()),
    }
}

#[derive(Serialize, Deserialize)]
struct Fragment {
    schemas: Vec<Schema>,
}

fn filter_schema(schema: &Schema, selector: &WriteSelector) -> Schema {
    let mut out = schema.clone();
    match selector {
        WriteSelector::All | WriteSelector::Schema(_) => {}
        WriteSelector::SchemaNoMemoryTables(_) => {
            out.tables.retain(|_, t| !t.memory_table);
        }
        WriteSelector::SchemaNoRoutines(_) => {
            out.routines.clear();
        }
    }
    out
}

/// Serialize the elements of `ais` accepted by `selector` into one
/// fragment.
pub fn serialize(ais: &Ais, selector: &WriteSelector) -> Result<Vec<u8>> {
    let schemas: Vec<Schema> = match selector {
        WriteSelector::All => ais
            .schemas()
            .map(|s| filter_schema(s, selector))
            .collect(),
        WriteSelector::Schema(name)
        | WriteSelector::SchemaNoMemoryTables(name)
        | WriteSelector::SchemaNoRoutines(name) => ais
            .schema(name)
            .map(|s| filter_schema(s, selector))
            .into_iter()
            .collect(),
    };
    let fragment = Fragment { schemas };
    let mut bytes = Vec::new();
    ciborium::into_writer(&fragment, &mut bytes)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Accumulates fragments into one snapshot.
#[derive(Default)]
pub struct AisReader {
    schemas: Vec<Schema>,
    seen: std::collections::HashSet<String>,
}

impl AisReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema names loaded so far.
    pub fn schema_names(&self) -> impl Iterator<Item = &str> {
        self.schemas.iter().map(|s| s.name.as_str())
    }

    /// Append one fragment. A schema already loaded is skipped; the
    /// online-cache path loads staged fragments first and relies on the
    /// first occurrence winning.
    pub fn load_fragment(&mut self, bytes: &[u8]) -> Result<()> {
        let fragment: Fragment =
            ciborium::from_reader(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        for schema in fragment.schemas {
            if self.seen.insert(schema.name.clone()) {
                self.schemas.push(schema);
            }
        }
        Ok(())
    }

    /// Resolve the accumulated fragments into a snapshot, overlaying them
    /// onto `base` (the process-local memory-table overlay), finalizing
    /// every table and validating the whole. The result is unfrozen with
    /// generation unset; the caller assigns and freezes.
    pub fn finish(self, base: &Ais) -> Result<Ais> {
        let mut ais = base.clone_unfrozen();
        ais.set_generation(0)?;
        for loaded in self.schemas {
            let schema = ais.schema_mut(&loaded.name)?;
            for (name, table) in loaded.tables {
                schema.tables.entry(name).or_insert(table);
            }
            for (name, sequence) in loaded.sequences {
                schema.sequences.entry(name).or_insert(sequence);
            }
            for (name, routine) in loaded.routines {
                schema.routines.entry(name).or_insert(routine);
            }
        }
        for schema in ais.schemas_map_mut()?.values_mut() {
            for table in schema.tables.values_mut() {
                crate::ais::finish_table(table);
            }
        }
        crate::ais::validate(&ais)?;
        Ok(ais)
    }
}
