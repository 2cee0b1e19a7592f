//! procraft - shared console sessions for a pool of operators
//!
//! This crate provides the core functionality for procraft, including:
//! - Controllers: long-lived upstream sessions with a rate-limited command queue
//! - Hooking operator terminals in and out of controllers
//! - The operator protocol, server and client
//!
//! # Architecture
//!
//! procraft uses a client-server model where:
//! - The server (`procraft-server`) owns every controller and its session
//! - The client (`procraft`) lets an operator list, drive and attach to them
//! - Communication happens over a Unix domain socket

pub mod auth;
pub mod client;
pub mod config;
pub mod controller;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;
