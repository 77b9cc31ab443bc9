//! HTTP handler functions, grouped by surface

mod agents;
mod approvals;
mod chat;
mod system;
mod tasks;

pub use agents::{heartbeat, list_agents, register_agent};
pub use approvals::{approve, get_approval, pending_approvals, reject};
pub use chat::chat_stream;
pub use system::{health, metrics};
pub use tasks::{execute_task, get_task, orchestrate, resume_task};
