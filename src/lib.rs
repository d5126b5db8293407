//! workbox - multi-tenant cloud workspace server.
//!
//! A workspace is a virtual project filesystem projected over a flat blob
//! store, plus optional live terminal/container sessions, shared in real
//! time between an owning user and invited collaborators.

pub mod container;
pub mod directory;
pub mod error;
pub mod files;
pub mod http;
pub mod limiter;
pub mod room;
pub mod state;
pub mod storage;
pub mod terminal;
pub mod tree;
pub mod ws;
