//! HTTP service surface for the BFM schema migration engine.
//!
//! The binary (`main.rs`) wires configuration, the script corpus, the state
//! tracker, and the executor, then serves the router assembled here.

pub mod auth;
pub mod dto;
pub mod handlers;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod stream;
