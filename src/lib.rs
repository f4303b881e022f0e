pub mod branch;
pub mod config;
pub mod customer;
pub mod directory;
pub mod message;
pub mod net;
pub mod task;
pub mod transport;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::branch::{Branch, BranchOptions};
pub use crate::customer::Customer;
pub use crate::directory::Directory;
pub use crate::transport::Transport;

pub type BranchId = u32;
pub type CustomerId = u32;
pub type WriteId = u64;
pub type Clock = u64;
/// Currency units. Signed so that a negative deposit can be represented and rejected.
pub type Amount = i64;
