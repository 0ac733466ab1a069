//! Core domain model and contracts for agentflow
//!
//! This crate holds everything agents and orchestrators agree on:
//! - Event envelope and reserved metadata keys
//! - State, AgentResult
//! - RunContext (cancellation + deadlines)
//! - Agent / AgentHandler contracts and adapters
//! - CallbackRegistry with lifecycle hook points
//! - Session storage

pub mod callbacks;
pub mod context;
pub mod contracts;
pub mod domain;
pub mod error;
pub mod events;
pub mod session;

pub use callbacks::*;
pub use context::*;
pub use contracts::*;
pub use domain::*;
pub use error::*;
pub use events::*;
pub use session::*;

/// Re-export common types
pub use anyhow::{Error, Result};
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;
