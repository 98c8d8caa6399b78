//! Workload kinds and the capability table the engine dispatches on.
//!
//! The engine never matches on a kind directly; it asks for [`Capabilities`]. A new kind only
//! needs a row in [`WorkloadKind::capabilities`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Stateless,
    #[default]
    Stateful,
    Replication,
    Consensus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Replicas elect a leader and expose it through a role label.
    pub leader_election: bool,
    /// Replicas must join/leave an internal membership protocol.
    pub member_join_leave: bool,
    /// Leadership can be handed off before a leader goes away.
    pub switchover: bool,
    /// New replicas are seeded from a backup of existing data.
    pub data_clone: bool,
}

impl WorkloadKind {
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Stateless => Capabilities { leader_election: false, member_join_leave: false, switchover: false, data_clone: false },
            Self::Stateful => Capabilities { leader_election: false, member_join_leave: false, switchover: false, data_clone: true },
            Self::Replication => Capabilities { leader_election: true, member_join_leave: true, switchover: true, data_clone: true },
            Self::Consensus => Capabilities { leader_election: true, member_join_leave: true, switchover: true, data_clone: true },
        }
    }
}
