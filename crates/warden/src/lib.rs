//! warden - privilege-separated module supervisor
//!
//! A privileged supervisor runs a fixed pipeline of untrusted modules. Each
//! module runs in its own forked worker under a distinct uid, gid and
//! SELinux label, and answers with exactly one fixed-size message over a
//! private datagram channel before the next stage starts.
//!
//! # Example
//!
//! ```no_run
//! use warden::{modules, Pipeline, SharedResources, WardenConfig};
//!
//! fn main() -> warden::Result<()> {
//!     let config = WardenConfig::resolve(None)?;
//!     let registry = modules::standard_registry(&config)?;
//!
//!     // Blocks SIGCHLD for this thread until dropped.
//!     let mut resources = SharedResources::new()?;
//!     let outcome = Pipeline::standard().run(
//!         &mut resources,
//!         &registry,
//!         &config.executor_config(),
//!     );
//!     std::process::exit(outcome.exit_code());
//! }
//! ```
//!
//! # Platform Support
//!
//! Linux only: the executor relies on epoll, signalfd and `PR_SET_PDEATHSIG`.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod identity;
pub mod ipc;
pub mod modules;
pub mod pipeline;
pub mod registry;
pub mod resources;
pub mod spawner;

// Re-exports for convenience
pub use config::WardenConfig;
pub use context::DaemonContext;
pub use error::{ProtocolError, Result, SpawnError, StageError, WardenError, WorkerError};
pub use executor::{execute_stage, ExecutorConfig, StageOutcome, StageReport};
pub use ipc::{Channel, Message, MESSAGE_SIZE, PAYLOAD_CAPACITY};
pub use modules::ModuleBody;
pub use pipeline::{FailurePolicy, Pipeline, PipelineOutcome, Stage, StageEffect, StageInput};
pub use registry::{Identity, ModuleDescriptor, ModuleEntry, ModuleId, Registry};
pub use resources::SharedResources;
