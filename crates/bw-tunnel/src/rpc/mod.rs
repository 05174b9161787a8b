//! Tunnel RPC: capability trait, server and client

pub mod client;
pub mod server;
pub mod service;
pub mod stream;

pub use client::TunnelClient;
pub use server::TunnelServer;
pub use service::{ByteStream, Tunnel};
pub use stream::{byte_stream, into_reader, ChunkWriter};
