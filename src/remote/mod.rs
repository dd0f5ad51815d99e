//! Remote execution over HTTP multipart.

pub mod client;
pub mod wire;

pub use client::RemoteExecutor;
pub use wire::{RequestEnvelope, ResponseMeta, WireCommand, WireGlob, WireInput, WireOutput};
