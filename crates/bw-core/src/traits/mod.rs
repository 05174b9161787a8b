//! Core trait definitions

mod listener;

pub use listener::{Listener, TcpAcceptor};
