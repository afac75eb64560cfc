//! agentdeck-pty: pseudo-terminal process management for agentdeck.
//!
//! This crate sits between an agent CLI (a real child process attached to a
//! PTY) and everything that consumes its output. It launches the child,
//! pumps raw output bytes out to registered consumers, writes keystrokes
//! back, and tears the child down with a bounded graceful-stop.
//!
//! # Architecture
//!
//! - [`ProcessProxy`] - owns one child process and its PTY (start, write,
//!   resize, stop) and fans output out to N consumers.
//! - [`EscapeFilter`] - streaming filter that strips screen-clearing and
//!   alternate-screen control sequences from an output stream.

pub mod error;
pub mod filter;
pub mod proxy;

pub use error::{PtyError, Result};
pub use filter::EscapeFilter;
pub use proxy::{ChildExit, ProcessProxy, ProxyStatus, WindowSize};
