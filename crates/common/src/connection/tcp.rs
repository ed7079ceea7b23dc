//! Authenticated TCP dialing and accepting.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use super::auth::{authenticate, AuthError, ConnAddrs};
use super::mux::{ConnectionId, HEADER_LEN, RPC_CHANNEL};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to send connection tag: {0}")]
    Tag(#[source] std::io::Error),
}

/// Dial `addr`, authenticate, and send `tag` (a connection id or
/// [`RPC_CHANNEL`]).
pub async fn dial_tagged<A: ToSocketAddrs>(addr: A, tag: &[u8], secret: &[u8]) -> Result<TcpStream, DialError> {
    if tag.len() != HEADER_LEN {
        return Err(DialError::Tag(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("connection tags are {HEADER_LEN} bytes, got {}", tag.len()),
        )));
    }

    let mut conn = TcpStream::connect(addr).await.map_err(DialError::Connect)?;
    let addrs = ConnAddrs::of_tcp(&conn).map_err(DialError::Connect)?;
    authenticate(&mut conn, &addrs, secret).await?;
    conn.write_all(tag).await.map_err(DialError::Tag)?;
    Ok(conn)
}

/// Open a data channel that the peer's waiter for `id` will receive.
pub async fn dial_typed_connection<A: ToSocketAddrs>(addr: A, id: &ConnectionId, secret: &[u8]) -> Result<TcpStream, DialError> {
    dial_tagged(addr, id.as_bytes(), secret).await
}

/// Open the RPC control channel.
pub async fn dial_rpc<A: ToSocketAddrs>(addr: A, secret: &[u8]) -> Result<TcpStream, DialError> {
    dial_tagged(addr, RPC_CHANNEL.as_bytes(), secret).await
}

/// Accept connections forever, authenticating each on its own task and
/// forwarding the ones that pass to `output`.
///
/// Returns when `output` is closed or the listener fails.
pub async fn accept_loop(listener: TcpListener, secret: Arc<Vec<u8>>, output: mpsc::Sender<TcpStream>) -> std::io::Result<()> {
    loop {
        let (mut conn, remote) = listener.accept().await?;
        if output.is_closed() {
            return Ok(());
        }
        let secret = secret.clone();
        let output = output.clone();
        tokio::spawn(async move {
            let addrs = match ConnAddrs::of_tcp(&conn) {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::debug!(%remote, error = %e, "connection vanished before auth");
                    return;
                }
            };
            match authenticate(&mut conn, &addrs, &secret).await {
                Ok(()) => {
                    let _ = output.send(conn).await;
                }
                // Liveness probes connect and hang up.
                Err(AuthError::Eof) => {}
                Err(e) => tracing::warn!(%remote, error = %e, "authentication error"),
            }
        });
    }
}
