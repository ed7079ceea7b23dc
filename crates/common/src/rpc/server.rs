use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::codec::{read_frame, write_frame};
use super::{Request, Response, RpcError};

/// Something that answers RPC requests.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Answer requests on `stream` one at a time until the peer hangs up.
pub async fn serve_connection<S, H>(mut stream: S, service: Arc<H>) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: RpcService + ?Sized,
{
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let kind = request.kind();
        let response = service.handle(request).await;
        if let Response::Error(ref e) = response {
            tracing::debug!(request = kind, error = %e, "request failed");
        }
        write_frame(&mut stream, &response).await?;
    }
    tracing::debug!("rpc peer closed connection");
    Ok(())
}
