//! Stream transport adapter
//!
//! Turns a readable and a writable byte stream (typically the stdin and
//! stdout of a process spawned over an SSH exec channel) into a
//! [`Listener`](crate::traits::Listener) that yields exactly one connection.

mod listener;
mod stream;

pub use listener::StdioListener;
pub use stream::StdioStream;
