//! agentdeck-app: the interactive front end.
//!
//! Owns the local terminal, routes keystrokes to the current agent, runs the
//! control panel, and shares the session with browsers over WebSockets.

pub mod cli;
pub mod control;
pub mod logging;
pub mod passthrough;
pub mod selector;
pub mod share;
pub mod terminal;
pub mod webterm;
