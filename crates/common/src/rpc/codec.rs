//! Length-prefixed bincode frames.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RpcError;

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(value).map_err(RpcError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(RpcError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Request;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, &Request::Status).await.unwrap();
        write_frame(&mut a, &Request::GetAttr { path: "/x".into() })
            .await
            .unwrap();
        drop(a);

        let first: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(Request::Status));
        let second: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(second, Some(Request::GetAttr { path: "/x".into() }));
        let end: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let result: Result<Option<Request>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(RpcError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let result: Result<Option<Request>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_malformed_hash_rejected_at_decode() {
        // Same wire shape as the leading `Request` variants, but with a bare
        // string where the digest goes.
        #[derive(serde::Serialize)]
        #[allow(dead_code)]
        enum Forged {
            GetAttr { path: String },
            ReadDir { path: String },
            FetchContent { hash: String },
        }

        for hash in ["../../etc/passwd", "a", ""] {
            let (mut a, mut b) = duplex(1024);
            let forged = Forged::FetchContent { hash: hash.into() };
            write_frame(&mut a, &forged).await.unwrap();
            let result: Result<Option<Request>, _> = read_frame(&mut b).await;
            assert!(matches!(result, Err(RpcError::Decode(_))), "accepted {hash:?}");
        }
    }
}
