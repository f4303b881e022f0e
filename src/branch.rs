//! Branch replica: one copy of the shared balance plus the per-customer write histories that
//! certify which writes this copy has observed.
//!
//! All mutable state sits behind a single mutex. A write holds it from verification through
//! the balance mutation and the history append, so no caller can observe one without the
//! other and at most one write is in flight per branch. The lock is released before the
//! write is fanned out to peers, which lets a peer that is propagating to this branch at
//! the same time make progress.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use serde::Serialize;
use tokio::{task::JoinSet, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    message::{Operation, Outcome, Request, Response, Source, WriteRecord},
    transport::Transport,
    Amount, BranchId, Clock, CustomerId, WriteId,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchOptions {
    /// Upper bound on waiting for every peer to acknowledge a propagated write. `None` waits
    /// indefinitely. On expiry the customer's call fails, while the local mutation stays
    /// applied.
    pub propagation_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Request,
    Execute,
    Response,
    PropagateRequest,
    PropagateExecute,
    PropagateResponse,
}

/// One logical clock tick, kept for inspection after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Event {
    pub operation: Operation,
    pub phase: Phase,
    pub clock: Clock,
}

#[derive(Debug)]
struct State {
    balance: Amount,
    clock: Clock,
    write_id: WriteId,
    write_history: HashMap<CustomerId, Vec<WriteRecord>>,
    events: Vec<Event>,
}

impl State {
    fn receive(&mut self, clock: Clock, operation: Operation, phase: Phase) {
        self.clock = self.clock.max(clock) + 1;
        self.record(operation, phase)
    }

    fn tick(&mut self, operation: Operation, phase: Phase) {
        self.clock += 1;
        self.record(operation, phase)
    }

    fn record(&mut self, operation: Operation, phase: Phase) {
        self.events.push(Event {
            operation,
            phase,
            clock: self.clock,
        })
    }

    // first contact creates an empty history, so an empty write set always matches it
    fn history(&mut self, customer: CustomerId) -> &mut Vec<WriteRecord> {
        self.write_history.entry(customer).or_default()
    }

    fn verify(&mut self, customer: CustomerId, write_set: &[WriteRecord]) -> bool {
        self.history(customer).as_slice() == write_set
    }

    /// Applies a write if the business rules allow it. The balance is untouched unless the
    /// outcome is `Success`.
    fn apply(&mut self, operation: Operation, amount: Amount) -> Outcome {
        match operation {
            Operation::Query => Outcome::Error,
            _ if amount < 0 => Outcome::Error,
            Operation::Deposit => {
                self.balance += amount;
                Outcome::Success
            }
            Operation::Withdraw if amount > self.balance => Outcome::Failure,
            Operation::Withdraw => {
                self.balance -= amount;
                Outcome::Success
            }
        }
    }
}

#[derive(Debug)]
pub struct Branch<T> {
    id: BranchId,
    peers: Vec<BranchId>,
    state: Mutex<State>,
    transport: T,
    options: BranchOptions,
}

impl<T> Branch<T> {
    pub fn new(
        id: BranchId,
        balance: Amount,
        peers: impl IntoIterator<Item = BranchId>,
        transport: T,
        options: BranchOptions,
    ) -> Self {
        let peers = peers.into_iter().filter(|&peer| peer != id).collect();
        Self {
            id,
            peers,
            state: Mutex::new(State {
                balance,
                clock: 1,
                write_id: 0,
                write_history: Default::default(),
                events: Default::default(),
            }),
            transport,
            options,
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn peers(&self) -> &[BranchId] {
        &self.peers
    }

    pub fn balance(&self) -> Amount {
        self.state.lock().unwrap().balance
    }

    pub fn clock(&self) -> Clock {
        self.state.lock().unwrap().clock
    }

    pub fn write_id(&self) -> WriteId {
        self.state.lock().unwrap().write_id
    }

    pub fn write_history(&self, customer: CustomerId) -> Option<Vec<WriteRecord>> {
        self.state
            .lock()
            .unwrap()
            .write_history
            .get(&customer)
            .cloned()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    fn response(&self, state: &State, outcome: Outcome, amount: Amount) -> Response {
        Response {
            outcome,
            source: Source::Branch,
            branch_id: self.id,
            amount,
            clock: state.clock,
            last_write_id: state.write_id,
        }
    }
}

impl<T: Transport> Branch<T> {
    /// Serves one request from either a customer or a peer branch.
    ///
    /// Protocol rejections are reported through [`Response::outcome`]. An `Err` means the
    /// request could not be completed at all, which only happens when propagating a write to
    /// the peers fails or times out.
    pub async fn handle(&self, request: Request) -> crate::Result<Response> {
        debug!(
            branch = self.id,
            customer = request.id,
            operation = request.operation.name(),
            source = ?request.source,
            amount = request.amount,
            clock = request.clock,
            "handle request"
        );
        match (request.source, request.operation) {
            (_, Operation::Query) => Ok(self.handle_query(&request)),
            (Source::Customer, _) => self.handle_write(request).await,
            (Source::Branch, _) => Ok(self.handle_propagation(&request)),
        }
    }

    fn handle_query(&self, request: &Request) -> Response {
        let mut state = self.state.lock().unwrap();
        state.receive(request.clock, Operation::Query, Phase::Request);
        if !state.verify(request.id, &request.write_set) {
            info!(
                branch = self.id,
                customer = request.id,
                "query rejected on stale write set"
            );
            return self.response(&state, Outcome::Error, 0);
        }
        state.tick(Operation::Query, Phase::Execute);
        let balance = state.balance;
        self.response(&state, Outcome::Success, balance)
    }

    async fn handle_write(&self, request: Request) -> crate::Result<Response> {
        let operation = request.operation;
        let (balance, propagation) = {
            let mut state = self.state.lock().unwrap();
            state.receive(request.clock, operation, Phase::Request);
            if !state.verify(request.id, &request.write_set) {
                info!(
                    branch = self.id,
                    customer = request.id,
                    operation = operation.name(),
                    "write rejected on stale write set"
                );
                return Ok(self.response(&state, Outcome::Error, 0));
            }
            let outcome = state.apply(operation, request.amount);
            state.tick(operation, Phase::Execute);
            match outcome {
                Outcome::Success => {}
                Outcome::Failure => {
                    info!(
                        branch = self.id,
                        customer = request.id,
                        amount = request.amount,
                        balance = state.balance,
                        "withdraw rejected on insufficient funds"
                    );
                    let balance = state.balance;
                    return Ok(self.response(&state, outcome, balance));
                }
                Outcome::Error => {
                    info!(
                        branch = self.id,
                        customer = request.id,
                        amount = request.amount,
                        operation = operation.name(),
                        "negative amount rejected"
                    );
                    return Ok(self.response(&state, outcome, 0));
                }
            }
            state.write_id += 1;
            let write_id = state.write_id;
            state.history(request.id).push(WriteRecord {
                branch_id: self.id,
                write_id,
            });
            (
                state.balance,
                request.propagation(self.id, write_id, state.clock),
            )
        };

        self.propagate(&propagation).await?;

        let mut state = self.state.lock().unwrap();
        state.tick(operation, Phase::Response);
        Ok(Response {
            last_write_id: propagation.last_write_id,
            ..self.response(&state, Outcome::Success, balance)
        })
    }

    async fn propagate(&self, request: &Request) -> crate::Result<()> {
        let mut acks = JoinSet::new();
        for &peer in &self.peers {
            let transport = self.transport.clone();
            let request = request.clone();
            acks.spawn(async move { (peer, transport.deliver(peer, request).await) });
        }
        let wait_all = async {
            while let Some(ack) = acks.join_next().await {
                let (peer, response) = ack?;
                let response = response.map_err(|err| {
                    warn!(branch = self.id, peer, "propagation failed: {err:#}");
                    err.context(format!("propagate to branch {peer}"))
                })?;
                if response.outcome != Outcome::Success {
                    info!(
                        branch = self.id,
                        peer,
                        outcome = ?response.outcome,
                        balance = response.amount,
                        "peer kept its balance for propagated write"
                    )
                }
                self.state.lock().unwrap().receive(
                    response.clock,
                    request.operation,
                    Phase::PropagateResponse,
                );
            }
            crate::Result::<_>::Ok(())
        };
        match self.options.propagation_timeout {
            None => wait_all.await,
            Some(duration) => timeout(duration, wait_all).await.map_err(|_| {
                warn!(branch = self.id, ?duration, "propagation timed out");
                crate::err!(
                    "propagation of write {} from branch {} timed out",
                    request.last_write_id,
                    self.id
                )
            })?,
        }
    }

    fn handle_propagation(&self, request: &Request) -> Response {
        let operation = request.operation;
        let mut state = self.state.lock().unwrap();
        state.receive(request.clock, operation, Phase::PropagateRequest);
        // a concurrent withdraw at another branch may have drained this replica since the
        // origin checked its own balance; the write is recorded either way so histories agree
        let outcome = state.apply(operation, request.amount);
        if outcome != Outcome::Success {
            info!(
                branch = self.id,
                origin = request.last_write_branch_id,
                customer = request.id,
                amount = request.amount,
                balance = state.balance,
                "propagated write left balance unchanged"
            )
        }
        state.tick(operation, Phase::PropagateExecute);
        state.write_id = request.last_write_id;
        state.history(request.id).push(WriteRecord {
            branch_id: request.last_write_branch_id,
            write_id: request.last_write_id,
        });
        let amount = match outcome {
            Outcome::Error => 0,
            _ => state.balance,
        };
        self.response(&state, outcome, amount)
    }
}
