//! Record service: hook pipeline over a [`crate::persistence::Persistence`].

mod hooks;
mod pipeline;

pub use hooks::{LifecycleHooks, NoHooks};
pub use pipeline::RecordService;
