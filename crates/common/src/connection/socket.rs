//! Local control socket discovery and dialing.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use super::mux::HEADER_LEN;

/// File name of the control socket in a source tree.
pub const SOCKET_NAME: &str = ".termite-socket";

/// Environment variable naming the socket path directly.
pub const SOCKET_ENV: &str = "TERMITE_SOCKET";

const MAX_TRIES: usize = 10;
const BASE_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("gave up dialing {path} after {tries} attempts: {source}")]
    Exhausted {
        path: PathBuf,
        tries: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("channel tag must be {HEADER_LEN} bytes, got {0:?}")]
    BadChannel(String),

    #[error("failed to send channel tag: {0}")]
    Io(#[from] std::io::Error),
}

/// Locate the control socket.
///
/// `TERMITE_SOCKET` wins when set. Otherwise walk up from `start` looking for
/// a socket named [`SOCKET_NAME`].
pub fn find_socket(start: &Path) -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    find_socket_from(start)
}

fn find_socket_from(start: &Path) -> Option<PathBuf> {
    start.ancestors().map(|dir| dir.join(SOCKET_NAME)).find(|candidate| {
        std::fs::symlink_metadata(candidate)
            .map(|meta| meta.file_type().is_socket())
            .unwrap_or(false)
    })
}

/// Next backoff: grows by a random fraction of the previous delay, plus the base.
fn next_delay(previous: Duration) -> Duration {
    let jitter: f64 = rand::rng().random();
    previous.mul_f64(1.5 + 0.5 * jitter) + BASE_DELAY
}

/// Dial the control socket and send `channel` as the connection tag.
///
/// Retries with randomized, growing backoff. Running out of attempts is
/// fatal for the caller.
pub async fn open_socket_connection(socket: &Path, channel: &str) -> Result<UnixStream, SocketError> {
    if channel.len() != HEADER_LEN {
        return Err(SocketError::BadChannel(channel.to_string()));
    }

    let mut delay = Duration::ZERO;
    let mut attempt = 0;
    let mut conn = loop {
        match UnixStream::connect(socket).await {
            Ok(conn) => break conn,
            Err(e) if attempt < MAX_TRIES => {
                tracing::info!(attempt, error = %e, "retrying dial");
                delay = next_delay(delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(SocketError::Exhausted {
                    path: socket.to_path_buf(),
                    tries: attempt,
                    source: e,
                })
            }
        }
    };

    conn.write_all(channel.as_bytes()).await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    #[test]
    fn test_next_delay_grows() {
        let first = next_delay(Duration::ZERO);
        assert_eq!(first, BASE_DELAY);
        let second = next_delay(first);
        assert!(second >= first.mul_f64(1.5) + BASE_DELAY);
        assert!(second <= first * 2 + BASE_DELAY);
    }

    #[tokio::test]
    async fn test_find_socket_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let socket = dir.path().join("a").join(SOCKET_NAME);
        let _listener = UnixListener::bind(&socket).unwrap();

        assert_eq!(find_socket_from(&nested), Some(socket));
    }

    #[test]
    fn test_find_socket_ignores_regular_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(SOCKET_NAME), b"").unwrap();
        assert_eq!(find_socket_from(dir.path()), None);
    }

    #[tokio::test]
    async fn test_open_socket_connection_sends_tag() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&socket).unwrap();

        let accept = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut tag = [0u8; HEADER_LEN];
            conn.read_exact(&mut tag).await.unwrap();
            tag
        });

        let _conn = open_socket_connection(&socket, "rpc.....").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"rpc.....");
    }

    #[tokio::test]
    async fn test_bad_channel_rejected() {
        let result = open_socket_connection(Path::new("/nonexistent"), "short").await;
        assert!(matches!(result, Err(SocketError::BadChannel(_))));
    }
}
