use crate::bridge::relay;
use crate::config::{ClientOptions, Port};
use crate::error::{Error, Result};
use crate::proto::{self, send_command, Command, RejectReason, Status};
use crate::transform;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::sleep,
};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exposes remote services as local listeners.
///
/// Every accepted local connection gets its own broker connection, which is
/// turned into the tunnel once the broker reports that the server accepted.
pub struct Client {
    broker_addr: Arc<str>,
    listeners: Vec<(TcpListener, Arc<Port>)>,
}

impl Client {
    /// Binds every port's local address up front, so a bad address fails
    /// before anything runs.
    pub async fn bind(opts: &ClientOptions) -> Result<Self> {
        let mut listeners = Vec::with_capacity(opts.ports.len());
        for port in &opts.ports {
            let listener = TcpListener::bind(port.address.as_str()).await?;
            listeners.push((listener, Arc::new(port.clone())));
        }

        Ok(Self {
            broker_addr: opts.broker_addr.as_str().into(),
            listeners,
        })
    }

    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|(l, _)| l.local_addr().map_err(Error::from))
            .collect()
    }

    pub async fn run(self) -> Result<()> {
        let mut loops = JoinSet::new();
        for (listener, port) in self.listeners {
            loops.spawn(accept_loop(self.broker_addr.clone(), listener, port));
        }

        while let Some(r) = loops.join_next().await {
            if let Err(e) = r {
                log::error!(err:% = e; "accept loop aborted");
            }
        }
        Ok(())
    }
}

async fn accept_loop(broker_addr: Arc<str>, listener: TcpListener, port: Arc<Port>) {
    if let Ok(addr) = listener.local_addr() {
        log::info!(port_mark:% = port.mark, listen_at:% = addr; "listening");
    }

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                log::error!(port_mark:% = port.mark, err:% = e; "accept new connection failed, retrying in 1s");
                sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let broker_addr = broker_addr.clone();
        let port = port.clone();
        tokio::spawn(async move {
            if let Err(e) = open_tunnel(&broker_addr, &port, stream, addr).await {
                if e.is_disconnect() {
                    log::info!(remote_addr:% = addr, port_mark:% = port.mark; "master closed connection");
                } else {
                    log::warn!(remote_addr:% = addr, port_mark:% = port.mark, err:% = e; "open tunnel failed");
                }
            }
        });
    }
}

async fn open_tunnel(broker_addr: &str, port: &Port, local: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(broker_addr).await?;
    send_command(&mut stream, Command::ClientHandshake, port.port_key.as_bytes()).await?;

    let frame = proto::read_frame(&mut stream).await?;
    match frame.status()? {
        Status::ServerAcceptClient => {
            let (r, w) = stream.into_split();
            let tunnel = transform::wrap(r, w, &port.port_key, port.cipher, port.compressor)?;
            log::debug!(remote_addr:% = addr, port_mark:% = port.mark; "tunnel established");
            relay(local.into_split(), tunnel);
        }
        Status::ServerRejectClient => {
            let reason = frame
                .payload
                .first()
                .and_then(|r| RejectReason::from_u8(*r));
            log::warn!(remote_addr:% = addr, port_mark:% = port.mark, reason:? = reason; "server rejected connection");
        }
        Status::PortKeyNotExist => {
            log::warn!(remote_addr:% = addr, port_mark:% = port.mark, port_key:% = port.port_key; "port key not registered on master");
        }
        Status::PortKeyConnectTimeout => {
            log::warn!(remote_addr:% = addr, port_mark:% = port.mark; "server did not answer in time");
        }
        s => return Err(Error::Protocol(format!("unexpected reply {:?}", s))),
    }
    Ok(())
}
