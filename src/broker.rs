use crate::bridge::relay;
use crate::config::BrokerOptions;
use crate::error::{Error, Result};
use crate::net::set_keepalive;
use crate::proto::{self, send_status, Command, Frame, NewClient, Status};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select, task,
    time::{sleep, timeout},
};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const MATCH_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);
const CONTROL_QUEUE_SIZE: usize = 16;

/// Rendezvous broker.
///
/// Servers keep a control connection open and register their port keys on it;
/// clients ask for a port key and are parked until the owning server dials back
/// with the matching guid, at which point the two connections are spliced.
pub struct Broker {
    listener: TcpListener,
    shared: Arc<Shared>,
    timeouts: Timeouts,
    count: u64,
}

#[derive(Clone, Copy)]
struct Timeouts {
    handshake: Duration,
    matching: Duration,
}

struct Shared {
    master_key: String,
    ports: PortRegistry,
    clients: PendingClients,
}

impl Broker {
    pub async fn bind(opts: &BrokerOptions) -> Result<Self> {
        let listener = TcpListener::bind(opts.listen_addr.as_str()).await?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                master_key: opts.master_key.clone(),
                ports: Default::default(),
                clients: Default::default(),
            }),
            timeouts: Timeouts {
                handshake: HANDSHAKE_TIMEOUT,
                matching: MATCH_TIMEOUT,
            },
            count: 0,
        })
    }

    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        self.timeouts.handshake = d;
        self
    }

    pub fn match_timeout(mut self, d: Duration) -> Self {
        self.timeouts.matching = d;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn next_id(&mut self) -> u64 {
        self.count += 1;
        self.count
    }

    pub async fn run(mut self) -> Result<()> {
        log::info!(listen_at:% = self.local_addr()?; "broker running");

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    log::error!(err:% = e; "accept new connection failed, retrying in 1s");
                    sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            let id = self.next_id();
            let shared = self.shared.clone();
            let timeouts = self.timeouts;
            task::spawn(async move {
                handle_conn(shared, timeouts, id, stream, addr).await;
            });
        }
    }
}

/// First message of every connection; selects what the connection becomes.
#[derive(Debug, PartialEq, Eq)]
enum Handshake {
    Server { master_key: String },
    Client { port_key: String },
    Accept { guid: String },
}

impl Handshake {
    fn parse(frame: Frame) -> Result<Self> {
        let cmd = frame.command()?;
        if frame.payload.is_empty() {
            return Err(Error::Protocol(format!("{:?} without payload", cmd)));
        }

        let value = frame.payload_str();
        match cmd {
            Command::ServerHandshake => Ok(Handshake::Server { master_key: value }),
            Command::ClientHandshake => Ok(Handshake::Client { port_key: value }),
            Command::ServerAcceptClientRequest => Ok(Handshake::Accept { guid: value }),
            _ => Err(Error::Protocol(format!("unexpected handshake {:?}", cmd))),
        }
    }
}

async fn handle_conn(
    shared: Arc<Shared>,
    timeouts: Timeouts,
    id: u64,
    mut stream: TcpStream,
    addr: SocketAddr,
) {
    log::debug!(remote_addr:% = addr, conn_id = id; "new connection coming");

    let frame = match timeout(timeouts.handshake, proto::read_frame(&mut stream)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            log::debug!(remote_addr:% = addr, err:% = e; "read handshake failed");
            return;
        }
        Err(_) => {
            log::debug!(remote_addr:% = addr; "handshake timeout");
            return;
        }
    };

    match Handshake::parse(frame) {
        Ok(Handshake::Server { master_key }) => {
            serve_control(&shared, id, stream, addr, &master_key).await
        }
        Ok(Handshake::Client { port_key }) => {
            match_client(&shared, timeouts, stream, addr, port_key).await
        }
        Ok(Handshake::Accept { guid }) => accept_client(&shared, stream, addr, &guid).await,
        Err(e) => log::debug!(remote_addr:% = addr, err:% = e; "bad handshake"),
    }
}

async fn serve_control(shared: &Shared, id: u64, mut stream: TcpStream, addr: SocketAddr, key: &str) {
    if key != shared.master_key {
        log::warn!(remote_addr:% = addr, remote_type = "server"; "master key mismatch");
        let _ = send_status(&mut stream, Status::MasterKeyMismatch, &[]).await;
        return;
    }
    if send_status(&mut stream, Status::Ready, &[]).await.is_err() {
        return;
    }
    if let Err(e) = set_keepalive(&stream) {
        log::debug!(remote_addr:% = addr, err:% = e; "set keepalive failed");
    }
    log::info!(remote_addr:% = addr, remote_type = "server"; "server connected");

    let (tx, rx) = channel(CONTROL_QUEUE_SIZE);
    let handle = ControlHandle { id, tx };
    let (r, w) = stream.into_split();

    let res = select! {
        r = read_control(shared, &handle, r, addr) => r,
        r = write_control(w, rx) => r,
    };

    let purged = shared.ports.purge(id);
    match res {
        Err(e) if !e.is_disconnect() => {
            log::debug!(remote_addr:% = addr, err:% = e, purged = purged; "read server packet failed")
        }
        _ => log::info!(remote_addr:% = addr, purged = purged; "server disconnected"),
    }
}

async fn read_control(
    shared: &Shared,
    handle: &ControlHandle,
    mut r: OwnedReadHalf,
    addr: SocketAddr,
) -> Result<()> {
    loop {
        let frame = proto::read_frame(&mut r).await?;

        match frame.command()? {
            Command::RegisterPortKey => {
                if frame.payload.is_empty() {
                    return Err(Error::Protocol("empty port key".into()));
                }
                let port_key = frame.payload_str();
                let status = if shared.ports.register(&port_key, handle.clone()) {
                    log::debug!(remote_addr:% = addr, port_key:% = port_key; "new port key register success");
                    Status::PortKeyRegSuccess
                } else {
                    log::warn!(remote_addr:% = addr, port_key:% = port_key; "port key already registered");
                    Status::PortKeyExist
                };

                let reply = proto::encode(status as u8, &frame.payload)?;
                handle.tx.send(reply).await.map_err(|_| Error::Closed)?;
            }
            Command::RejectClientRequest => {
                if frame.payload.len() < 2 {
                    return Err(Error::Protocol("short reject request".into()));
                }
                let reason = frame.payload[0];
                let guid = String::from_utf8_lossy(&frame.payload[1..]).into_owned();

                match shared.clients.take(&guid) {
                    Some(mut conn) => {
                        log::info!(remote_addr:% = addr, guid:% = guid, reason = reason; "server rejected client");
                        task::spawn(async move {
                            let _ = send_status(&mut conn, Status::ServerRejectClient, &[reason]).await;
                        });
                    }
                    None => {
                        log::debug!(remote_addr:% = addr, guid:% = guid; "reject for a client no longer waiting")
                    }
                }
            }
            cmd => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} on control connection",
                    cmd
                )))
            }
        }
    }
}

async fn write_control(mut w: OwnedWriteHalf, mut rx: Receiver<Vec<u8>>) -> Result<()> {
    while let Some(buf) = rx.recv().await {
        w.write_all(&buf).await?;
    }
    Ok(())
}

fn new_guid() -> String {
    format!("{:032x}", rand::random::<u128>())
}

async fn match_client(
    shared: &Shared,
    timeouts: Timeouts,
    mut stream: TcpStream,
    addr: SocketAddr,
    port_key: String,
) {
    let server = match shared.ports.lookup(&port_key) {
        Some(server) => server,
        None => {
            log::info!(remote_addr:% = addr, remote_type = "client", port_key:% = port_key; "port key not registered");
            let _ = send_status(&mut stream, Status::PortKeyNotExist, port_key.as_bytes()).await;
            return;
        }
    };

    let guid = new_guid();
    let done = match shared.clients.insert(&guid, stream) {
        Ok(done) => done,
        Err(_) => {
            log::error!(remote_addr:% = addr, guid:% = guid; "guid already pending");
            return;
        }
    };

    let notice = NewClient {
        port_key: port_key.clone(),
        guid: guid.clone(),
    }
    .encode()
    .and_then(|payload| proto::encode(Status::NewClientComing as u8, &payload));

    // one deadline for the notice and the wait
    let matched = timeout(timeouts.matching, async {
        server.tx.send(notice?).await.map_err(|_| Error::Closed)?;
        log::debug!(remote_addr:% = addr, port_key:% = port_key, guid:% = guid; "waiting for server");
        done.await.map_err(|_| Error::Closed)
    })
    .await;

    match matched {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::debug!(remote_addr:% = addr, port_key:% = port_key, err:% = e; "notify server failed");
            shared.clients.take(&guid);
        }
        Err(_) => {
            if let Some(mut conn) = shared.clients.take(&guid) {
                log::info!(remote_addr:% = addr, port_key:% = port_key, guid:% = guid; "server connect timeout");
                let _ = send_status(&mut conn, Status::PortKeyConnectTimeout, &[]).await;
            }
        }
    }
}

async fn accept_client(shared: &Shared, stream: TcpStream, addr: SocketAddr, guid: &str) {
    let mut client = match shared.clients.take(guid) {
        Some(client) => client,
        None => {
            log::debug!(remote_addr:% = addr, guid:% = guid; "no pending client for guid");
            return;
        }
    };

    if let Err(e) = send_status(&mut client, Status::ServerAcceptClient, &[]).await {
        log::debug!(remote_addr:% = addr, guid:% = guid, err:% = e; "notify client failed");
        return;
    }

    log::debug!(remote_addr:% = addr, guid:% = guid; "client matched");
    relay(stream.into_split(), client.into_split());
}

/// Write side of a server control connection.
#[derive(Clone)]
struct ControlHandle {
    id: u64,
    tx: Sender<Vec<u8>>,
}

/// Port key -> owning control connection.
#[derive(Default)]
struct PortRegistry {
    ports: RwLock<HashMap<String, ControlHandle>>,
}

impl PortRegistry {
    /// Returns false if the key is already owned by a control connection.
    fn register(&self, port_key: &str, handle: ControlHandle) -> bool {
        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        if ports.contains_key(port_key) {
            return false;
        }
        ports.insert(port_key.to_string(), handle);
        true
    }

    fn lookup(&self, port_key: &str) -> Option<ControlHandle> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port_key)
            .cloned()
    }

    /// Drops every key owned by control connection `id`.
    fn purge(&self, id: u64) -> usize {
        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        let before = ports.len();
        ports.retain(|_, h| h.id != id);
        before - ports.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ports.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct PendingClient {
    conn: TcpStream,
    done: oneshot::Sender<()>,
}

/// Clients parked until their server dials back, keyed by guid.
#[derive(Default)]
struct PendingClients {
    clients: Mutex<HashMap<String, PendingClient>>,
}

impl PendingClients {
    fn insert(&self, guid: &str, conn: TcpStream) -> std::result::Result<oneshot::Receiver<()>, TcpStream> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if clients.contains_key(guid) {
            return Err(conn);
        }

        let (done, rx) = oneshot::channel();
        clients.insert(guid.to_string(), PendingClient { conn, done });
        Ok(rx)
    }

    /// Removes the entry and fires its signal; only the first caller gets the
    /// connection.
    fn take(&self, guid: &str) -> Option<TcpStream> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let client = clients.remove(guid)?;
        let _ = client.done.send(());
        Some(client.conn)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
