pub mod boxed;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod exec;
pub mod remote;
pub mod syntax;
pub mod validate;
pub mod workdir;
pub mod wrap;

pub use boxed::{BoxedCommand, BoxedExecutor, BoxedResult, ExecutorBackend};
pub use command::{Command, StderrPolicy};
pub use error::{Result, RunboxError};
pub use exec::{UnboxedExecutor, UnboxedResult};
