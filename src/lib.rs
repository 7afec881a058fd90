#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]

//! This crate implements the core of a MongoDB client driver: the session and transaction state
//! machine that coordinates logical sessions, causal consistency, and multi-statement
//! transactions over a pool of connections to a deployment.
//!
//! It deliberately does not implement the pieces around that core — the wire protocol, topology
//! monitoring, server selection, or CRUD helpers. Those are represented here only by the
//! [`topology::Topology`] trait; a full driver built on top of this crate supplies a real
//! implementation backed by its own connection pool and SDAM.

pub use ::bson;

mod bson_util;
mod client;
pub mod concern;
pub mod error;
pub mod options;
pub mod session;
pub mod topology;

pub use crate::{
    client::Client,
    session::{ClientSession, TransactionState},
};
