//! Handlers for commands the relay sends to the agent, one module per command.

pub mod logpoint_add;
pub mod logpoint_remove;
pub mod logpoints_list;
pub mod relay_error;

pub use logpoint_add::logpoint_add;
pub use logpoint_remove::logpoint_remove;
pub use logpoints_list::logpoints_list;
pub use relay_error::relay_error;
