//! Wire format shared by the broker, servers and clients.
//!
//! Every message is a frame: a big-endian `u16` length, then that many bytes.
//! The first byte of the body is a [`Command`] (towards the broker) or a
//! [`Status`] (from the broker); the rest is the payload.

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body (code byte plus payload).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ServerHandshake = 0x1,
    ClientHandshake = 0x2,
    RegisterPortKey = 0x3,
    RejectClientRequest = 0x4,
    ServerAcceptClientRequest = 0x5,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x1 => Command::ServerHandshake,
            0x2 => Command::ClientHandshake,
            0x3 => Command::RegisterPortKey,
            0x4 => Command::RejectClientRequest,
            0x5 => Command::ServerAcceptClientRequest,
            _ => return Err(Error::Protocol(format!("unsupported command {:#x}", code))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ready = 0,
    MasterKeyMismatch = 1,
    PortKeyExist = 2,
    PortKeyNotExist = 3,
    PortKeyRegSuccess = 4,
    PortKeyConnectTimeout = 5,
    NewClientComing = 6,
    ServerRejectClient = 7,
    ServerAcceptClient = 8,
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Status::Ready,
            1 => Status::MasterKeyMismatch,
            2 => Status::PortKeyExist,
            3 => Status::PortKeyNotExist,
            4 => Status::PortKeyRegSuccess,
            5 => Status::PortKeyConnectTimeout,
            6 => Status::NewClientComing,
            7 => Status::ServerRejectClient,
            8 => Status::ServerAcceptClient,
            _ => return Err(Error::Protocol(format!("unsupported status {}", code))),
        })
    }
}

/// Why a server refused a matched client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    PortKeyNotFound = 1,
    LocalConnectFailed = 2,
}

impl RejectReason {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(RejectReason::PortKeyNotFound),
            2 => Some(RejectReason::LocalConnectFailed),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(&self) -> Result<Command> {
        Command::try_from(self.code)
    }

    pub fn status(&self) -> Result<Status> {
        Status::try_from(self.code)
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

pub fn encode(code: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len() + 1;
    if len > MAX_FRAME_LEN {
        return Err(Error::MessageTooLarge(len));
    }

    let mut buf = Vec::with_capacity(len + 2);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.push(code);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads until `buf` is full or the stream ends, returning the byte count.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let mut len = [0u8; 2];
    match read_full(r, &mut len).await? {
        0 => return Err(Error::Closed),
        2 => {}
        n => return Err(Error::Framing(format!("read length failed, want 2 got {}", n))),
    }

    let len = u16::from_be_bytes(len) as usize;
    if len == 0 {
        return Err(Error::Framing("zero length".into()));
    }

    let mut buf = vec![0; len];
    let n = read_full(r, &mut buf).await?;
    if n != len {
        return Err(Error::Framing(format!(
            "read body failed, want {} got {}",
            len, n
        )));
    }

    let payload = buf.split_off(1);
    Ok(Frame {
        code: buf[0],
        payload,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, code: u8, payload: &[u8]) -> Result<()> {
    let buf = encode(code, payload)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn send_command<W: AsyncWrite + Unpin>(
    w: &mut W,
    cmd: Command,
    payload: &[u8],
) -> Result<()> {
    write_frame(w, cmd as u8, payload).await
}

pub async fn send_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: Status,
    payload: &[u8],
) -> Result<()> {
    write_frame(w, status as u8, payload).await
}

/// Payload of [`Status::NewClientComing`]: `[u8 len][port key][guid]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClient {
    pub port_key: String,
    pub guid: String,
}

impl NewClient {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let key = self.port_key.as_bytes();
        let len = u8::try_from(key.len())
            .map_err(|_| Error::Protocol("port key longer than 255 bytes".into()))?;

        let mut buf = Vec::with_capacity(1 + key.len() + self.guid.len());
        buf.push(len);
        buf.extend_from_slice(key);
        buf.extend_from_slice(self.guid.as_bytes());
        Ok(buf)
    }

    /// Returns `None` for an empty port key, a truncated key or a missing guid.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (&len, rest) = payload.split_first()?;
        let len = len as usize;
        if len == 0 || len >= rest.len() {
            return None;
        }

        let (key, guid) = rest.split_at(len);
        Some(Self {
            port_key: String::from_utf8_lossy(key).into_owned(),
            guid: String::from_utf8_lossy(guid).into_owned(),
        })
    }
}

/// Payload of [`Command::RejectClientRequest`]: `[u8 reason][guid]`.
pub fn encode_reject(reason: RejectReason, guid: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + guid.len());
    buf.push(reason as u8);
    buf.extend_from_slice(guid.as_bytes());
    buf
}
