//! Symmetric challenge-response authentication with a pre-shared secret.
//!
//! Both peers run the same procedure:
//!
//! * send a 20-byte random challenge
//! * read the peer's challenge, answer with
//!   `HMAC-SHA256(secret, peer_challenge ‖ "remote-local")`
//! * read the peer's answer and check it against
//!   `HMAC-SHA256(secret, own_challenge ‖ "local-remote")`
//! * exchange a 2-byte `OK`
//!
//! The signed address pair ties the proof to this transport connection, so a
//! captured handshake cannot be replayed on another one.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

type HmacSha256 = Hmac<Sha256>;

pub const CHALLENGE_LEN: usize = 20;
const SIGNATURE_LEN: usize = 32;
const ACK: &[u8; 2] = b"OK";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Peer hung up mid-handshake. Liveness probes do this routinely.
    #[error("connection closed during handshake")]
    Eof,

    #[error("signature mismatch from {0}")]
    Mismatch(String),

    #[error("missing or garbled ack from {0}")]
    BadAck(String),

    #[error("secret rejected as hmac key")]
    BadKey,

    #[error("io error during handshake: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for AuthError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            AuthError::Eof
        } else {
            AuthError::Io(err)
        }
    }
}

/// The address pair of one transport connection, as each side sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAddrs {
    pub local: String,
    pub remote: String,
}

impl ConnAddrs {
    pub fn new(local: impl fmt::Display, remote: impl fmt::Display) -> Self {
        Self {
            local: local.to_string(),
            remote: remote.to_string(),
        }
    }

    pub fn of_tcp(stream: &TcpStream) -> io::Result<Self> {
        let local: SocketAddr = stream.local_addr()?;
        let remote: SocketAddr = stream.peer_addr()?;
        Ok(Self::new(local, remote))
    }

    /// The same connection seen from the other end.
    pub fn swapped(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

fn sign(
    secret: &[u8],
    challenge: &[u8],
    addrs: &ConnAddrs,
    local_first: bool,
) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::BadKey)?;
    mac.update(challenge);
    let binding = if local_first {
        format!("{}-{}", addrs.local, addrs.remote)
    } else {
        format!("{}-{}", addrs.remote, addrs.local)
    };
    mac.update(binding.as_bytes());
    Ok(mac)
}

/// Run the handshake on `stream`. On error the caller must drop the stream.
pub async fn authenticate<S>(stream: &mut S, addrs: &ConnAddrs, secret: &[u8]) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::rng().fill_bytes(&mut challenge);
    stream.write_all(&challenge).await?;
    stream.flush().await?;
    let expected = sign(secret, &challenge, addrs, true)?;

    let mut remote_challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut remote_challenge).await?;
    let proof = sign(secret, &remote_challenge, addrs, false)?
        .finalize()
        .into_bytes();
    stream.write_all(&proof).await?;
    stream.flush().await?;

    let mut response = [0u8; SIGNATURE_LEN];
    stream.read_exact(&mut response).await?;
    if expected.verify_slice(&response).is_err() {
        tracing::warn!(remote = %addrs.remote, "authentication failure");
        let _ = stream.shutdown().await;
        return Err(AuthError::Mismatch(addrs.remote.clone()));
    }

    stream.write_all(ACK).await?;
    stream.flush().await?;
    let mut ack = [0u8; 2];
    stream.read_exact(&mut ack).await?;
    if &ack != ACK {
        return Err(AuthError::BadAck(addrs.remote.clone()));
    }

    Ok(())
}
