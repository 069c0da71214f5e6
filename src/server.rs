use crate::bridge::relay;
use crate::config::{Port, ServerOptions};
use crate::error::{Error, Result};
use crate::net::set_keepalive;
use crate::proto::{self, encode_reject, send_command, Command, NewClient, RejectReason, Status};
use crate::transform;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::mpsc::{channel, Receiver, Sender},
    task::spawn,
    time::{sleep, timeout},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(8);
const CONTROL_QUEUE_SIZE: usize = 16;

/// Publishes local services through a broker.
///
/// Keeps one control connection to the broker, registers every configured
/// port key on it and dials back a fresh connection for each client the
/// broker announces.
pub struct Server {
    broker_addr: Arc<str>,
    master_key: String,
    // configuration order, which is also registration order
    ports: Arc<[Port]>,
    reconnect_delay: Duration,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            broker_addr: opts.broker_addr.into(),
            master_key: opts.master_key,
            ports: opts.ports.into(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    fn port(&self, port_key: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.port_key == port_key)
    }

    pub fn reconnect_delay(mut self, d: Duration) -> Self {
        self.reconnect_delay = d;
        self
    }

    /// Runs until the broker refuses the master key.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.serve_control().await {
                Err(Error::MasterKeyMismatch) => {
                    log::error!(master:% = self.broker_addr; "master key mismatch");
                    return Err(Error::MasterKeyMismatch);
                }
                Err(e) => {
                    log::warn!(master:% = self.broker_addr, err:% = e; "control connection lost, reconnecting in {:?}", self.reconnect_delay)
                }
                Ok(()) => {
                    log::warn!(master:% = self.broker_addr; "control connection closed, reconnecting in {:?}", self.reconnect_delay)
                }
            }
            sleep(self.reconnect_delay).await;
        }
    }

    async fn handshake(&self) -> Result<TcpStream> {
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&*self.broker_addr))
            .await
            .map_err(|_| Error::Timeout("connecting to master"))??;

        send_command(&mut stream, Command::ServerHandshake, self.master_key.as_bytes()).await?;
        let frame = timeout(HANDSHAKE_TIMEOUT, proto::read_frame(&mut stream))
            .await
            .map_err(|_| Error::Timeout("waiting for master handshake"))??;

        match frame.status()? {
            Status::Ready => {}
            Status::MasterKeyMismatch => return Err(Error::MasterKeyMismatch),
            s => return Err(Error::Protocol(format!("unexpected handshake reply {:?}", s))),
        }

        if let Err(e) = set_keepalive(&stream) {
            log::debug!(err:% = e; "set keepalive failed");
        }
        Ok(stream)
    }

    async fn serve_control(&self) -> Result<()> {
        let stream = self.handshake().await?;
        log::info!(master:% = self.broker_addr; "connected to master");

        let (r, w) = stream.into_split();
        let (tx, rx) = channel(CONTROL_QUEUE_SIZE);

        select! {
            r = self.read_control(r, &tx) => r,
            r = write_control(w, rx) => r,
        }
    }

    async fn read_control(&self, mut r: OwnedReadHalf, tx: &Sender<Vec<u8>>) -> Result<()> {
        for port in self.ports.iter() {
            let buf = proto::encode(Command::RegisterPortKey as u8, port.port_key.as_bytes())?;
            tx.send(buf).await.map_err(|_| Error::Closed)?;
        }

        loop {
            let frame = proto::read_frame(&mut r).await?;

            match frame.status()? {
                Status::PortKeyRegSuccess => {
                    let port_key = frame.payload_str();
                    let mark = self.port(&port_key).map(|p| p.mark.as_str());
                    log::info!(port_key:% = port_key, port_mark:? = mark; "port key registered");
                }
                Status::PortKeyExist => {
                    let port_key = frame.payload_str();
                    let mark = self.port(&port_key).map(|p| p.mark.as_str());
                    log::warn!(port_key:% = port_key, port_mark:? = mark; "port key already registered by another server");
                }
                Status::NewClientComing => {
                    let nc = match NewClient::parse(&frame.payload) {
                        Some(nc) => nc,
                        None => {
                            log::debug!(len = frame.payload.len(); "malformed new client notice");
                            continue;
                        }
                    };
                    self.new_client(nc, tx).await?;
                }
                s => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} on control connection",
                        s
                    )))
                }
            }
        }
    }

    async fn new_client(&self, nc: NewClient, tx: &Sender<Vec<u8>>) -> Result<()> {
        let port = match self.port(&nc.port_key) {
            Some(port) => port.clone(),
            None => {
                log::warn!(port_key:% = nc.port_key, guid:% = nc.guid; "client for unknown port key");
                let payload = encode_reject(RejectReason::PortKeyNotFound, &nc.guid);
                let buf = proto::encode(Command::RejectClientRequest as u8, &payload)?;
                return tx.send(buf).await.map_err(|_| Error::Closed);
            }
        };

        log::debug!(port_key:% = nc.port_key, port_mark:% = port.mark, guid:% = nc.guid; "new client coming");
        spawn(accept_client(self.broker_addr.clone(), port, nc.guid, tx.clone()));
        Ok(())
    }
}

async fn write_control(mut w: OwnedWriteHalf, mut rx: Receiver<Vec<u8>>) -> Result<()> {
    while let Some(buf) = rx.recv().await {
        w.write_all(&buf).await?;
    }
    Ok(())
}

async fn accept_client(broker_addr: Arc<str>, port: Port, guid: String, tx: Sender<Vec<u8>>) {
    let local = match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(port.address.as_str())).await {
        Ok(Ok(local)) => local,
        r => {
            let err = match r {
                Ok(Err(e)) => e.to_string(),
                _ => "timeout".to_string(),
            };
            log::warn!(port_mark:% = port.mark, local_address:% = port.address, guid:% = guid, err:% = err; "dial local service failed");

            let payload = encode_reject(RejectReason::LocalConnectFailed, &guid);
            if let Ok(buf) = proto::encode(Command::RejectClientRequest as u8, &payload) {
                let _ = tx.send(buf).await;
            }
            return;
        }
    };
    drop(tx);

    if let Err(e) = dial_back(&broker_addr, &port, &guid, local).await {
        log::warn!(port_mark:% = port.mark, guid:% = guid, err:% = e; "accept client failed");
    }
}

async fn dial_back(broker_addr: &str, port: &Port, guid: &str, local: TcpStream) -> Result<()> {
    let mut stream = TcpStream::connect(broker_addr).await?;
    send_command(&mut stream, Command::ServerAcceptClientRequest, guid.as_bytes()).await?;

    let (r, w) = stream.into_split();
    let tunnel = transform::wrap(r, w, &port.port_key, port.cipher, port.compressor)?;
    log::debug!(port_mark:% = port.mark, guid:% = guid; "tunnel established");
    relay(local.into_split(), tunnel);
    Ok(())
}
