//! agentdeck-pool: agent catalogue, instances and the pool that owns them.
//!
//! - [`profiles`] - per-type table (display name, command, setup, batch args).
//! - [`detect`] - finds which agent CLIs are installed.
//! - [`AgentInstance`] - one launched agent: proxy, output buffer, sink, exit channel.
//! - [`AgentPool`] - creates and reuses instances per type, runs one-shot
//!   batch calls, stops everything on shutdown.

pub mod args;
pub mod detect;
pub mod error;
pub mod instance;
pub mod pool;
pub mod profiles;

pub use args::ArgTemplates;
pub use detect::AgentInfo;
pub use error::{PoolError, Result};
pub use instance::{AgentInstance, InstanceStatus, OutputSink, StdoutSink};
pub use pool::{AgentPool, CreateOptions, InstanceSummary};
pub use profiles::{profile, AgentProfile};
