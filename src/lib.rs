//! Purpose: Library crate behind the `framegate` binary and its integration tests.
//! Exports: `core` (frames, codec, requests, errors), `backends`, `api`, `server`,
//! `client`, `config`, `repeating`.
//! Role: Streaming tabular data gateway over pluggable storage backends.
//! Invariants: Transports only talk to backends through `api::Api`.
pub mod api;
pub mod backends;
pub mod client;
pub mod config;
pub mod core;
pub mod repeating;
pub mod server;
