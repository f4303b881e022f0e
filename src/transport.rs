use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    branch::Branch,
    message::{Request, Response},
    BranchId,
};

/// Request/response delivery to a branch, shared by customer sessions and by branches
/// propagating to their peers.
#[async_trait::async_trait]
pub trait Transport
where
    Self: Clone + Send + Sync + 'static,
{
    async fn deliver(&self, destination: BranchId, request: Request) -> crate::Result<Response>;
}

/// In-process transport that calls the destination branch directly.
#[derive(Clone, Default)]
pub struct Loopback(Arc<RwLock<HashMap<BranchId, Arc<Branch<Loopback>>>>>);

impl std::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids = self.0.read().unwrap().keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        f.debug_tuple("Loopback").field(&ids).finish()
    }
}

impl Loopback {
    pub fn register(&self, branch: Arc<Branch<Loopback>>) {
        self.0.write().unwrap().insert(branch.id(), branch);
    }

    pub fn branch(&self, id: BranchId) -> crate::Result<Arc<Branch<Loopback>>> {
        self.0
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| crate::err!("branch {id} not registered"))
    }
}

#[async_trait::async_trait]
impl Transport for Loopback {
    async fn deliver(&self, destination: BranchId, request: Request) -> crate::Result<Response> {
        let branch = self.branch(destination)?;
        branch.handle(request).await
    }
}
