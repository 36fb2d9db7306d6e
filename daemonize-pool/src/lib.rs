//! A pool of repeatedly-invoked background daemons.
//!
//! Each function handed to a [`DaemonPool`] runs on its own tokio task and is
//! called again every time it returns, until the pool asks it to stop:
//! - [`DaemonPool::start`] / [`DaemonPool::start_name`] — async daemon functions
//! - [`DaemonPool::start_blocking`] / [`DaemonPool::start_blocking_name`] — synchronous ones
//! - [`DaemonPool::stop`] — stop one named daemon and wait for it
//! - [`DaemonPool::stop_all`] — stop everything and wait
//!
//! Stop requests are only observed between calls, so daemon functions must
//! return every so often (use `tokio::time::timeout`, socket deadlines, etc).

mod error;
mod pool;

pub use error::PoolError;
pub use pool::{DaemonPool, PoolStatus};
