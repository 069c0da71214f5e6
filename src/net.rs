use socket2::{SockRef, TcpKeepalive};
use std::io::Result;
use std::time::Duration;
use tokio::net::TcpStream;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Turns on TCP keepalive so a vanished peer on a long-lived control
/// connection eventually surfaces as a read error.
pub(crate) fn set_keepalive(stream: &TcpStream) -> Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
