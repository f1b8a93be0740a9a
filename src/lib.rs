//! A multi-room, real-time chat service.
//!
//! Clients connect over a websocket to a named room, exchange JSON-framed
//! commands and events, and see a synchronized view of presence and
//! history. Rooms, messages, accounts, and key material persist to a
//! relational store; multiple server processes coordinate through a small
//! cluster contract.

pub mod account;
pub mod api;
pub mod auth;
pub mod backend;
pub mod cluster;
pub mod config;
mod error;
pub mod nick;
pub mod pm;
pub mod presence;
pub mod room;
pub mod security;
pub mod server;
pub mod session;
pub mod snowflake;

pub use error::{Error, Result};
