pub mod dispatcher;
pub mod service;

pub use dispatcher::CommandDispatcher;
pub use service::{ApplyReport, ConfigApplyError, ConfigApplyService};
