//! bw-tunnel: Tunnel RPC service and multi-hop orchestration
//!
//! - [`rpc`]: the `Tunnel` capability trait, a framed server and a
//!   multiplexing client speaking the `bw-protocol` wire format
//! - [`relay`]: a hop that answers some calls itself and forwards the rest
//! - [`host`]: the answering side, backed by local git, docker and files
//! - [`inject`]: getting the agent binary onto the far side
//! - [`container`]: the outer/inner SSH handshake into a container

pub mod container;
pub mod error;
pub mod host;
pub mod inject;
pub mod io;
pub mod relay;
pub mod rpc;

pub use container::{ContainerTunnel, WorkspaceClient};
pub use error::{OrchestrationError, Phase, TunnelError};
pub use host::HostTunnel;
pub use inject::{AgentInjector, InjectOptions, ScriptInjector};
pub use io::CommandIo;
pub use relay::{run_proxy_server, ProxyServer};
pub use rpc::{ByteStream, Tunnel, TunnelClient, TunnelServer};
