//! Data model shared by agents and orchestrators

pub mod result;
pub mod state;

pub use result::AgentResult;
pub use state::State;
