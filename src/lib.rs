//! Orchestration core for multi-phase agent pipelines: a phase state
//! machine under capability locks, a resource governor, a backlog
//! scheduler with revision loops, and a cross-pipeline interop queue.

pub mod artifacts;
pub mod backlog;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod governor;
pub mod guard;
pub mod init;
pub mod interop;
pub mod locks;
pub mod logging;
pub mod machine;
pub mod pipeline;
pub mod revision;
pub mod scheduler;
pub mod settings;
pub mod ui;
pub mod util;
