//! shfrp: shell commands as reactive cells.
//!
//! Commands are templates over named parameters (`echo {name} is {age}`).
//! Whenever a parameter a running template references changes, the command
//! is rendered again and re-executed, and only the freshest result is
//! displayed. The engine modules ([`store`], [`template`], [`graph`],
//! [`bus`], [`watcher`], [`engine`]) know nothing about files or terminals;
//! the remaining modules connect them to the `shfrp` command line.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod graph;
pub mod output;
pub mod runner;
pub mod state;
pub mod store;
pub mod template;
pub mod watcher;

pub use engine::Engine;
pub use error::Error;
pub use graph::WatcherId;
pub use runner::{EchoExecutor, ExecutionOutcome, ExecutionStatus, Executor, ShellExecutor};
pub use store::ParameterStore;
pub use template::Template;
pub use watcher::Delivery;
