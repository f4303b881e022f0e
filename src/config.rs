use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};

use crate::{customer::Step, Amount, BranchId, CustomerId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Entry {
    Branch(BranchConfig),
    Customer(CustomerConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub id: BranchId,
    pub balance: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerConfig {
    pub id: CustomerId,
    #[serde(default)]
    pub events: Vec<Step>,
}

/// A run description: the branches to start and the customer scripts to replay, in file
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Input {
    pub branches: Vec<BranchConfig>,
    pub customers: Vec<CustomerConfig>,
}

impl Input {
    pub fn parse(json: &str) -> crate::Result<Self> {
        let mut input = Self::default();
        for entry in serde_json::from_str::<Vec<Entry>>(json)? {
            match entry {
                Entry::Branch(branch) => input.branches.push(branch),
                Entry::Customer(customer) => input.customers.push(customer),
            }
        }
        input.validate()?;
        Ok(input)
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| crate::err!("read input {}: {err}", path.display()))?;
        Self::parse(&json)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.branches.is_empty() {
            crate::bail!("no branch configured")
        }
        let mut branch_ids = HashSet::new();
        for branch in &self.branches {
            if !branch_ids.insert(branch.id) {
                crate::bail!("duplicated branch {}", branch.id)
            }
            if branch.balance < 0 {
                crate::bail!("branch {} starts with negative balance", branch.id)
            }
        }
        let mut customer_ids = HashSet::new();
        for customer in &self.customers {
            if !customer_ids.insert(customer.id) {
                crate::bail!("duplicated customer {}", customer.id)
            }
            if let Some(step) = customer
                .events
                .iter()
                .find(|step| !branch_ids.contains(&step.branch))
            {
                crate::bail!(
                    "customer {} targets unknown branch {}",
                    customer.id,
                    step.branch
                )
            }
        }
        Ok(())
    }
}

/// Final observation of one customer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerOutput {
    pub id: CustomerId,
    pub balance: Amount,
}

pub fn write_json(path: impl AsRef<Path>, value: &impl Serialize) -> crate::Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|err| crate::err!("write {}: {err}", path.display()))
}
