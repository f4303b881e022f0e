use std::{collections::BTreeMap, net::SocketAddr};

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::BranchId;

/// Static map from branch id to the address its server listens on.
///
/// Shared read-only by every branch and customer session for the lifetime of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, From, Serialize, Deserialize)]
pub struct Directory(BTreeMap<BranchId, SocketAddr>);

impl Directory {
    pub fn insert(&mut self, id: BranchId, addr: SocketAddr) -> crate::Result<()> {
        if let Some(prev) = self.0.get(&id) {
            crate::bail!("duplicated branch {id} (already at {prev})")
        }
        self.0.insert(id, addr);
        Ok(())
    }

    pub fn branch_addr(&self, id: BranchId) -> crate::Result<SocketAddr> {
        self.0
            .get(&id)
            .copied()
            .ok_or_else(|| crate::err!("branch {id} address not found"))
    }

    pub fn branch_ids(&self) -> impl Iterator<Item = BranchId> + '_ {
        self.0.keys().copied()
    }

    /// Every branch except `id`, in ascending id order.
    pub fn peers_of(&self, id: BranchId) -> Vec<BranchId> {
        self.branch_ids().filter(|&peer| peer != id).collect()
    }
}
