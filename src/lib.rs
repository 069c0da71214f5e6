//!A TCP tunnel to reach services behind NAT or a firewall.
//!
//!A node behind NAT only allows outbound connections, so nobody can dial its services directly.
//!burrow puts a publicly reachable broker in the middle, and lets both sides dial out to it.
//!
//!## How burrow works
//!There are three roles:
//!
//!- **broker** (called `master` in config files) listens on a public address, keeps track of which server owns which port key,
//!  and splices client connections with server connections.
//!- **server** runs next to the services to publish. It keeps a control connection to the broker, registers one port key per service,
//!  and opens a new connection back to the broker for every client the broker announces.
//!- **client** runs where the services are consumed. It listens on a local address per port key and, for every accepted connection,
//!  asks the broker for that port key.
//!
//!Once a match is made the broker only relays bytes. Servers and clients wrap the tunnel with the same cipher and compressor,
//!picked per port from [`transform`].
//!
//!The `aes-128-cfb` cipher keeps the payload away from casual observers of the broker or the network path.
//!Its IV is sent in clear and there is no integrity check, so it does not protect against an active attacker.
//!
//!## Feature flags
//!- `env_logger`, `structopt`: needed by the `burrow` binary only. Disable default features to use the engines as a library.

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
mod net;
#[doc(hidden)]
pub mod proto;
pub mod server;
pub mod transform;

pub use broker::Broker;
pub use client::Client;
pub use config::{BrokerOptions, ClientOptions, Config, Mode, Port, ServerOptions};
pub use error::{Error, Result};
pub use server::Server;

/// Binds and runs a broker; returns only if binding fails.
pub async fn run_broker(opts: BrokerOptions) -> Result<()> {
    Broker::bind(&opts).await?.run().await
}

/// Runs a server; only returns on master key mismatch.
pub async fn run_server(opts: ServerOptions) -> Result<()> {
    Server::new(opts).run().await
}

pub async fn run_client(opts: ClientOptions) -> Result<()> {
    Client::bind(&opts).await?.run().await
}
