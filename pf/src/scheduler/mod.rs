//! Command queue and dispatch

mod dispatcher;
mod queue;

pub(crate) use dispatcher::Dispatcher;
pub use queue::{CommandQueue, Dispatch, ManagerStats};
