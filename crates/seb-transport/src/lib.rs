//! SEB Session Transport Layer
//!
//! Thin HTTP surface over the session API:
//! - `POST /rpc` carries one JSON-RPC 2.0 request per call
//! - `GET /health` reports liveness and the request count
//! - `GET /events` streams server notifications as server-sent events
//!
//! The transport only decodes and encodes. Routing happens behind the
//! `RequestHandler` trait, authentication is not handled here.

pub mod server;

pub use server::{RequestHandler, TransportConfig, TransportServer};
