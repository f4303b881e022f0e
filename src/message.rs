use serde::{Deserialize, Serialize};

use crate::{Amount, BranchId, Clock, CustomerId, WriteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Query,
    Withdraw,
    Deposit,
}

impl Operation {
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Query)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Withdraw => "withdraw",
            Self::Deposit => "deposit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Customer,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// Business rule rejected the operation, e.g. insufficient funds.
    Failure,
    /// Causal precondition violated or malformed operation.
    Error,
}

/// One causally ordered write: the branch that originated it and the sequence number it was
/// assigned there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteRecord {
    pub branch_id: BranchId,
    pub write_id: WriteId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    pub source: Source,
    // always the customer that issued the write, also when relayed between branches
    pub id: CustomerId,
    pub amount: Amount,
    pub clock: Clock,
    pub last_write_id: WriteId,
    pub last_write_branch_id: BranchId,
    pub write_set: Vec<WriteRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    pub outcome: Outcome,
    pub source: Source,
    pub branch_id: BranchId,
    pub amount: Amount,
    pub clock: Clock,
    pub last_write_id: WriteId,
}

impl Request {
    /// The replication message a primary sends to each peer after applying `self` locally.
    pub fn propagation(&self, origin: BranchId, write_id: WriteId, clock: Clock) -> Self {
        Self {
            operation: self.operation,
            source: Source::Branch,
            id: self.id,
            amount: self.amount,
            clock,
            last_write_id: write_id,
            last_write_branch_id: origin,
            write_set: Vec::new(),
        }
    }
}
