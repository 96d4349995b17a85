pub mod agent;
pub mod cancel;
pub mod tools;

pub use agent::{AgentEvent, AgentLoop};
pub use cancel::{CancelMap, CancelToken};
