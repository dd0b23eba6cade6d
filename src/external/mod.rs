//! Production collaborators for the upgrade orchestrator
//!
//! Chain queries over HTTP, upgrade steps as hook commands, and the devnet
//! metadata recorder. Command execution sits behind a trait so hooks can be
//! tested without spawning processes.

pub mod command;
pub mod hooks;
pub mod recorder;
pub mod rpc;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use hooks::HookSteps;
pub use recorder::{FileDevnetRecorder, METADATA_FILE_NAME};
pub use rpc::HttpChainRpc;
