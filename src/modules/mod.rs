//! Modules compiled into the runtime

mod merger_queue;

pub(crate) use merger_queue::handler_dependency;
pub use merger_queue::{merger_queue_descriptor, MergerQueueModule, MERGER_QUEUE_MODULE};
