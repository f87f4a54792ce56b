#![warn(rust_2018_idioms)]
#![warn(missing_docs)]
#![deny(missing_debug_implementations)]

//! # pion
//!
//! pion is a lightweight HTTP/1.1 server framework with an
//! event-processing platform layered on top.
//!
//! The crate is split into two halves that share a common scheduler:
//!
//! - **Network**: a [`Scheduler`] owning the worker-thread pool and
//!   async I/O runtime, a [`tcp::TcpServer`] acceptor with keep-alive
//!   and pipelining aware connection lifecycles, an incremental
//!   [`http::Parser`] for requests, responses and chunked bodies, and
//!   an [`http::HttpServer`] that routes resources to plug-in backed
//!   [`http::WebService`]s.
//! - **Platform**: a [`reactor::ReactorEngine`] that routes
//!   reference-counted [`reactor::Event`]s through a directed acyclic
//!   graph of reactors, including an HTTP protocol decoder that pairs
//!   captured request/response traffic into clickstream events, a
//!   batching database inserter, and a codec-driven log writer with
//!   file rotation.
//!
//! Servers register themselves as *active users* of the scheduler;
//! [`Scheduler::shutdown`] does not return until every user has been
//! released and all worker threads have been joined.

pub use crate::error::{Error, Result};

pub mod config;
mod error;
pub mod http;
pub mod plugin;
pub mod process;
pub mod reactor;
pub mod scheduler;
pub mod services;
pub mod tcp;

pub use crate::scheduler::Scheduler;
