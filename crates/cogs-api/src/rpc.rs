//! RPC tunnel served over a connection taken over by `CONNECT /api`
//!
//! One JSON request per line in, one JSON response per line out. Calls are
//! answered in order. A claim still waiting when the client stops sending
//! is abandoned.

use cogs_broker::Wait;
use cogs_core::rpc::{
    ClaimArgs, ReleaseArgs, RpcRequest, RpcResponse, METHOD_CLAIM, METHOD_RELEASE, METHOD_STATUS,
};
use cogs_core::{ClaimStatus, CogsError, CogsResult};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::rest::AppState;

/// A decoded line, or the reason it could not be decoded
type Frame = Result<RpcRequest, String>;

/// Serve RPC calls on `io` on behalf of `owner` until the client goes away
pub async fn serve_tunnel<IO>(io: IO, state: Arc<AppState>, owner: String)
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session = Uuid::new_v4();
    let span = info_span!("rpc", session = %session, owner = %owner);

    async move {
        info!("Tunnel opened");

        let (reader, mut writer) = tokio::io::split(io);
        let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(16);
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_task = tokio::spawn(
            async move {
                let mut lines = BufReader::new(reader).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => {
                            let frame = serde_json::from_str::<RpcRequest>(&line)
                                .map_err(|e| format!("invalid request: {}", e));
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "Tunnel read failed");
                            break;
                        }
                    }
                }
                let _ = closed_tx.send(true);
            }
            .in_current_span(),
        );

        while let Some(frame) = frames_rx.recv().await {
            let response = match frame {
                Ok(request) => match dispatch(&state, &owner, request, closed_rx.clone()).await {
                    Some(response) => response,
                    None => break,
                },
                Err(e) => RpcResponse::err(Value::Null, e),
            };

            if let Err(e) = write_response(&mut writer, &response).await {
                debug!(error = %e, "Tunnel write failed");
                break;
            }
        }

        reader_task.abort();
        info!("Tunnel closed");
    }
    .instrument(span)
    .await
}

async fn write_response<W>(writer: &mut W, response: &RpcResponse) -> CogsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Run one call; `None` when the client left while it was pending
async fn dispatch(
    state: &AppState,
    owner: &str,
    request: RpcRequest,
    mut closed: watch::Receiver<bool>,
) -> Option<RpcResponse> {
    let id = request.id.clone();
    debug!(method = %request.method, "RPC call");

    let result: CogsResult<RpcResponse> = match request.method.as_str() {
        METHOD_STATUS => RpcResponse::ok(id.clone(), state.store.snapshot().await),
        METHOD_CLAIM => {
            let args: ClaimArgs = match request.params() {
                Ok(args) => args,
                Err(e) => return Some(RpcResponse::err(id, e)),
            };
            let wait = args
                .timeout
                .map(Wait::from_secs)
                .unwrap_or(state.default_wait);

            tokio::select! {
                biased;
                result = state.broker.claim(args.count, wait, owner) => {
                    result.and_then(|devices| RpcResponse::ok(id.clone(), ClaimStatus { devices }))
                }
                _ = closed.wait_for(|closed| *closed) => {
                    info!(count = args.count, "Client left, abandoning claim");
                    return None;
                }
            }
        }
        METHOD_RELEASE => match request.params::<ReleaseArgs>() {
            Ok(args) => state
                .broker
                .release(&args.devices, owner)
                .await
                .and_then(|devices| RpcResponse::ok(id.clone(), ReleaseArgs { devices })),
            Err(e) => Err(e),
        },
        other => Err(CogsError::Protocol(format!("can't find method {}", other))),
    };

    Some(result.unwrap_or_else(|e| RpcResponse::err(id, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app_state, FixedIdentity};
    use std::time::Duration;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        fn connect(state: Arc<AppState>, owner: &str) -> (Self, tokio::task::JoinHandle<()>) {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let handle = tokio::spawn(serve_tunnel(server, state, owner.to_string()));
            let (reader, writer) = tokio::io::split(client);
            (
                Self {
                    lines: BufReader::new(reader).lines(),
                    writer,
                },
                handle,
            )
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn call(&mut self, request: RpcRequest) -> RpcResponse {
            self.send_raw(&serde_json::to_string(&request).unwrap()).await;
            self.recv().await
        }

        async fn recv(&mut self) -> RpcResponse {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn claim(id: u64, count: u32, timeout: f64) -> RpcRequest {
        RpcRequest::new(
            id,
            METHOD_CLAIM,
            ClaimArgs {
                count,
                timeout: Some(timeout),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_claim_release() {
        let state = app_state(2, FixedIdentity::owner("alice@example.com"));
        let (mut client, _handle) = Client::connect(state.clone(), "alice@example.com");

        let response = client
            .call(RpcRequest::new(1, METHOD_STATUS, Value::Null).unwrap())
            .await;
        assert_eq!(response.id, Value::from(1));
        assert!(response.error.is_none());
        assert!(response.result["devices"]["GPU-0000"].is_object());

        let response = client.call(claim(2, 2, 0.0)).await;
        assert!(response.error.is_none());
        let status: ClaimStatus = serde_json::from_value(response.result).unwrap();
        assert_eq!(status.numbers(), vec![0, 1]);

        let response = client
            .call(RpcRequest::new(3, METHOD_RELEASE, ReleaseArgs { devices: vec![1] }).unwrap())
            .await;
        assert_eq!(response.result["devices"], serde_json::json!([1]));

        let snapshot = state.store.snapshot().await;
        assert_eq!(snapshot.devices["GPU-0000"].claim.user, "alice@example.com");
        assert!(snapshot.devices["GPU-0001"].claim.is_free());
    }

    #[tokio::test]
    async fn test_errors_are_replies() {
        let state = app_state(1, FixedIdentity::owner("alice@example.com"));
        let (mut client, _handle) = Client::connect(state.clone(), "bob@example.com");

        client.send_raw("not json").await;
        let response = client.recv().await;
        assert_eq!(response.id, Value::Null);
        assert!(response.error.unwrap().starts_with("invalid request"));

        let response = client
            .call(RpcRequest::new(4, "Cogs.Nope", Value::Null).unwrap())
            .await;
        assert!(response.error.unwrap().contains("Cogs.Nope"));

        state
            .broker
            .claim(1, Wait::Immediate, "alice@example.com")
            .await
            .unwrap();

        let response = client.call(claim(5, 1, 0.0)).await;
        assert_eq!(response.id, Value::from(5));
        assert_eq!(response.result, Value::Null);
        assert!(response.error.unwrap().contains("Timed out"));

        let response = client
            .call(RpcRequest::new(6, METHOD_RELEASE, ReleaseArgs { devices: vec![0] }).unwrap())
            .await;
        assert!(response.error.unwrap().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_disconnect_abandons_claim() {
        let state = app_state(1, FixedIdentity::owner("alice@example.com"));
        state
            .broker
            .claim(1, Wait::Immediate, "alice@example.com")
            .await
            .unwrap();

        let (mut client, handle) = Client::connect(state.clone(), "bob@example.com");
        client.send_raw(&serde_json::to_string(&claim(1, 1, -1.0)).unwrap()).await;

        while state.broker.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.broker.waiting(), 0);
        assert_eq!(
            state.store.snapshot().await.devices["GPU-0000"].claim.user,
            "alice@example.com"
        );
    }
}
