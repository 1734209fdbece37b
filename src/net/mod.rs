//! Broker-to-broker transport.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{TcpTransport, Transport};
pub use server::{RequestHandler, Server};
pub use wire::{Reply, Request};
