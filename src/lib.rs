//! Remote filesystem and debug tunnel for hosted web apps.
//!
//! - [`vfs::RemoteFs`] serves a host's home directory as a virtual
//!   filesystem over the host's remote file API, with a lazily refreshed
//!   [`cache::DirectoryCache`] and optimistic-concurrency writes.
//! - [`tunnel::TunnelProxy`] relays local debugger connections over one
//!   shared WebSocket tunnel to the host.
//! - [`orchestrator::RemoteDebugOrchestrator`] strings the tunnel setup
//!   together for a debugger attach.

pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod host;
pub mod orchestrator;
pub mod path;
pub mod tunnel;
pub mod uri;
pub mod vfs;
