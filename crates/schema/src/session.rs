//! Sessions
//!
//! A session is the unit of snapshot attachment: the first AIS access in
//! a transaction pins a snapshot, every later access returns the same
//! instance, and the manager's transaction wrapper detaches it at
//! transaction end. A session owns at most one online change at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ais::Ais;

/// State of one DDL-in-progress owned by a session.
#[derive(Debug, Clone)]
pub struct OnlineSession {
    pub id: i64,
    /// Tables this online change has registered change sets for.
    pub table_ids: BTreeSet<i32>,
}

impl OnlineSession {
    pub(crate) fn new(id: i64) -> Self {
        Self {
            id,
            table_ids: BTreeSet::new(),
        }
    }
}

/// Per-caller state bag handed to every schema-manager operation.
#[derive(Debug, Default)]
pub struct Session {
    pub(crate) attached_ais: Option<Arc<Ais>>,
    pub(crate) online: Option<OnlineSession>,
    /// Whether this transaction already bumped the generation on behalf
    /// of an online change becoming externally visible.
    pub(crate) bumped_generation: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot pinned by this transaction, if any.
    pub fn attached_ais(&self) -> Option<&Arc<Ais>> {
        self.attached_ais.as_ref()
    }

    /// The online change this session owns, if any.
    pub fn online_session(&self) -> Option<&OnlineSession> {
        self.online.as_ref()
    }

    pub(crate) fn detach(&mut self) {
        self.attached_ais = None;
        self.bumped_generation = false;
    }
}
