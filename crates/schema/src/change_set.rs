//! Change sets: the logical description of one table's online change
//!
//! Writing a change set claims its table for the owning online session.
//! For as long as the session lives, every online-cache build decodes
//! the stored change sets to route concurrent DML: a table with a claim
//! gets its row keys logged under the session's dml subtree. The claim
//! disappears with the rest of the online subtree at finalize or abort.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Drop,
    Modify,
}

/// One element-level change (a column or an index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub old_name: Option<String>,
    pub new_name: Option<String>,
}

impl Change {
    pub fn add(name: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Add,
            old_name: None,
            new_name: Some(name.into()),
        }
    }

    pub fn drop(name: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Drop,
            old_name: Some(name.into()),
            new_name: None,
        }
    }

    pub fn modify(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Modify,
            old_name: Some(old.into()),
            new_name: Some(new.into()),
        }
    }
}

/// The full description of one table's mutation during an online DDL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub table_id: i32,
    pub table_name: String,
    pub old_schema: String,
    pub new_schema: String,
    pub column_changes: Vec<Change>,
    pub index_changes: Vec<Change>,
}

impl ChangeSet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}
