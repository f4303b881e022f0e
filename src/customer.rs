use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    message::{Operation, Outcome, Request, Response, Source, WriteRecord},
    transport::Transport,
    Amount, BranchId, Clock, CustomerId, WriteId,
};

/// One scripted operation, in the shape the input file spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "interface")]
    pub operation: Operation,
    #[serde(rename = "dest")]
    pub branch: BranchId,
    #[serde(rename = "money", default)]
    pub amount: Amount,
}

/// The causal context a customer carries from one request to the next.
///
/// `write_set` mirrors the history every branch keeps for this customer, so it must be
/// extended exactly once per write the branches accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CausalContext {
    pub last_write_branch_id: BranchId,
    pub last_write_id: WriteId,
    pub write_set: Vec<WriteRecord>,
}

impl CausalContext {
    fn observe(&mut self, operation: Operation, response: &Response) {
        if !operation.is_write() || response.outcome != Outcome::Success {
            return;
        }
        self.last_write_branch_id = response.branch_id;
        self.last_write_id = response.last_write_id;
        self.write_set.push(WriteRecord {
            branch_id: response.branch_id,
            write_id: response.last_write_id,
        })
    }
}

#[derive(Debug)]
pub struct Customer<T> {
    pub id: CustomerId,
    script: Vec<Step>,
    transport: T,
    context: CausalContext,
    clock: Clock,
    balance: Amount,
    responses: Vec<Response>,
}

impl<T> Customer<T> {
    pub fn new(id: CustomerId, script: impl Into<Vec<Step>>, transport: T) -> Self {
        Self {
            id,
            script: script.into(),
            transport,
            context: Default::default(),
            clock: 1,
            balance: 0,
            responses: Default::default(),
        }
    }

    pub fn context(&self) -> &CausalContext {
        &self.context
    }

    /// Balance reported by the latest successful query.
    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    fn request(&mut self, step: &Step) -> Request {
        self.clock += 1;
        Request {
            operation: step.operation,
            source: Source::Customer,
            id: self.id,
            amount: if step.operation.is_write() {
                step.amount
            } else {
                0
            },
            clock: self.clock,
            last_write_id: self.context.last_write_id,
            last_write_branch_id: self.context.last_write_branch_id,
            write_set: self.context.write_set.clone(),
        }
    }
}

impl<T: Transport> Customer<T> {
    /// Replays the script in order, waiting for each response before sending the next
    /// request. Returns the customer id with the last balance it observed.
    pub async fn run(&mut self) -> crate::Result<(CustomerId, Amount)> {
        for step in self.script.clone() {
            let request = self.request(&step);
            debug!(
                customer = self.id,
                branch = step.branch,
                operation = step.operation.name(),
                amount = request.amount,
                last_write_id = request.last_write_id,
                last_write_branch_id = request.last_write_branch_id,
                "send request"
            );
            let response = self.transport.deliver(step.branch, request).await?;
            info!(
                customer = self.id,
                branch = response.branch_id,
                operation = step.operation.name(),
                outcome = ?response.outcome,
                amount = response.amount,
                clock = response.clock,
                last_write_id = response.last_write_id,
                "received response"
            );
            self.clock = self.clock.max(response.clock) + 1;
            self.context.observe(step.operation, &response);
            if step.operation == Operation::Query && response.outcome == Outcome::Success {
                self.balance = response.amount
            }
            self.responses.push(response)
        }
        Ok((self.id, self.balance))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{branch::Branch, transport::Loopback, BranchOptions};

    fn cluster(balances: &[(BranchId, Amount)]) -> Loopback {
        let transport = Loopback::default();
        let ids = balances.iter().map(|&(id, _)| id).collect::<Vec<_>>();
        for &(id, balance) in balances {
            transport.register(Arc::new(Branch::new(
                id,
                balance,
                ids.clone(),
                transport.clone(),
                BranchOptions::default(),
            )));
        }
        transport
    }

    fn step(operation: Operation, branch: BranchId, amount: Amount) -> Step {
        Step {
            operation,
            branch,
            amount,
        }
    }

    #[tokio::test]
    async fn read_your_writes_on_other_replica() -> crate::Result<()> {
        let transport = cluster(&[(1, 100), (2, 100)]);
        let mut customer = Customer::new(
            1,
            [
                step(Operation::Deposit, 1, 10),
                step(Operation::Deposit, 1, 20),
                step(Operation::Query, 2, 0),
            ],
            transport.clone(),
        );
        assert_eq!(customer.run().await?, (1, 130));
        let expected = vec![
            WriteRecord {
                branch_id: 1,
                write_id: 1,
            },
            WriteRecord {
                branch_id: 1,
                write_id: 2,
            },
        ];
        assert_eq!(customer.context().write_set, expected);
        assert_eq!(customer.context().last_write_branch_id, 1);
        assert_eq!(customer.context().last_write_id, 2);
        for id in [1, 2] {
            assert_eq!(transport.branch(id)?.write_history(1), Some(expected.clone()));
        }
        assert!(customer
            .responses()
            .iter()
            .all(|response| response.outcome == Outcome::Success));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_writes_leave_context_unchanged() -> crate::Result<()> {
        let transport = cluster(&[(1, 100), (2, 100)]);
        let mut customer = Customer::new(
            1,
            [
                step(Operation::Withdraw, 2, 500),
                step(Operation::Deposit, 1, -1),
                step(Operation::Withdraw, 2, 40),
                step(Operation::Query, 1, 0),
            ],
            transport,
        );
        assert_eq!(customer.run().await?, (1, 60));
        let outcomes = customer
            .responses()
            .iter()
            .map(|response| response.outcome)
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            [
                Outcome::Failure,
                Outcome::Error,
                Outcome::Success,
                Outcome::Success
            ]
        );
        assert_eq!(
            customer.context().write_set,
            [WriteRecord {
                branch_id: 2,
                write_id: 1,
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn query_amount_ignored() -> crate::Result<()> {
        let transport = cluster(&[(1, 100)]);
        let mut customer = Customer::new(1, [step(Operation::Query, 1, 999)], transport);
        assert_eq!(customer.run().await?, (1, 100));
        Ok(())
    }

    #[tokio::test]
    async fn clock_advances_past_branch() -> crate::Result<()> {
        let transport = cluster(&[(1, 100), (2, 100)]);
        let mut customer = Customer::new(
            1,
            [step(Operation::Deposit, 1, 1), step(Operation::Query, 2, 0)],
            transport,
        );
        customer.run().await?;
        let clocks = customer
            .responses()
            .iter()
            .map(|response| response.clock)
            .collect::<Vec<_>>();
        assert!(customer.clock > clocks[1]);
        assert!(clocks[0] < clocks[1]);
        Ok(())
    }

    #[tokio::test]
    async fn first_request_stamped_after_initial_clock() -> crate::Result<()> {
        let transport = cluster(&[(1, 100)]);
        let mut customer = Customer::new(1, [step(Operation::Query, 1, 0)], transport.clone());
        customer.run().await?;
        // the customer sends 2, the fresh branch moves from 1 to 3 on receipt
        let events = transport.branch(1)?.events();
        assert_eq!(events[0].clock, 3);
        assert_eq!(customer.clock, 5);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_run_independently() -> crate::Result<()> {
        let transport = cluster(&[(1, 0), (2, 0), (3, 0)]);
        let mut sessions = tokio::task::JoinSet::new();
        for id in 1..=6 {
            let script = (0..4)
                .map(|round| step(Operation::Deposit, (id + round) % 3 + 1, 5))
                .collect::<Vec<_>>();
            let mut customer = Customer::new(id, script, transport.clone());
            sessions.spawn(async move {
                customer.run().await?;
                crate::Result::<_>::Ok(customer)
            });
        }
        while let Some(customer) = sessions.join_next().await {
            let customer = customer??;
            assert_eq!(customer.context().write_set.len(), 4);
            assert!(customer
                .responses()
                .iter()
                .all(|response| response.outcome == Outcome::Success));
        }
        for id in [1, 2, 3] {
            assert_eq!(transport.branch(id)?.balance(), 120);
        }
        Ok(())
    }
}
