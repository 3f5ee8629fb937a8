//! Task lifecycle, scheduling and transaction-coordination core of the
//! queue broker. Backend-agnostic: storage is abstracted behind
//! [`store::TaskStore`] and transaction boundaries behind [`tx::Scope`], so
//! this crate has no knowledge of Postgres, the wire protocol, or HTTP.

pub mod clock;
pub mod domain;
pub mod error;
pub mod idempotency;
pub mod queue;
pub mod store;
pub mod task;
pub mod tx;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use domain::{Task, TaskStatus};
pub use error::{Error, Result};
pub use idempotency::IdempotencyCache;
pub use queue::{PushRequest, QueueService};
pub use store::{StoreError, StoreResult, TaskStore};
pub use task::TaskService;
pub use tx::{Scope, TxCoordinator, TxError};
