//! Authenticated, tagged connections between master and worker.

pub mod auth;
pub mod mux;
pub mod socket;
pub mod tcp;

pub use auth::{authenticate, AuthError, ConnAddrs};
pub use mux::{ConnectionId, MuxError, PendingConnections, HEADER_LEN, RPC_CHANNEL};
pub use socket::{find_socket, open_socket_connection, SocketError, SOCKET_ENV, SOCKET_NAME};
pub use tcp::{accept_loop, dial_rpc, dial_tagged, dial_typed_connection, DialError};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a channel can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A type-erased [`Stream`], so TCP, Unix and in-memory transports mix.
pub type BoxedStream = Box<dyn Stream>;
