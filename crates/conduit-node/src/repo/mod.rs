//! Policy repository: the in-memory forwarding table plus its kernel
//! match-set mirror.
//!
//! Policy rows and set entries must be updated together by the caller;
//! the repository does not couple them itself. The periodic cluster pull
//! reconverges any drift.

pub mod ipset;
pub mod policy;

pub use ipset::MatchSets;
pub use policy::{Policy, PolicyMaps, PolicyTable};

/// Shared repository handle: one policy table, one set mirror.
#[derive(Default)]
pub struct Repo {
    pub table: PolicyTable,
    pub sets: MatchSets,
}

impl Repo {
    pub fn new() -> Self {
        Self::default()
    }
}
