//! Process helpers shared across the workspace: command construction and
//! child-process teardown.

mod command;
#[cfg(feature = "tokio")]
mod supervise;

pub use command::{NoWindowExt, probe_version, std_command};
#[cfg(feature = "tokio")]
pub use command::tokio_command;
#[cfg(feature = "tokio")]
pub use supervise::{describe_exit, kill_and_reap, wait_or_kill};
