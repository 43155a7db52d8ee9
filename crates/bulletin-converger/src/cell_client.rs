//! Control channel to cells.
//!
//! Convergence only ever tells a cell to stop an instance it should not be
//! running: `POST http://<rep_address>/lrps/stop` with the
//! [`StopLrpInstance`] as a JSON body. Any 2xx is success.

use std::time::Duration;

use async_trait::async_trait;
use bulletin_core::StopLrpInstance;
use bytes::Bytes;
use http_body_util::Full;
use tracing::debug;

use crate::error::{CellClientError, CellClientResult};

/// Path on the cell's rep that stops one instance.
pub const STOP_LRP_PATH: &str = "/lrps/stop";

#[async_trait]
pub trait CellClient: Send + Sync + 'static {
    async fn stop_lrp_instance(
        &self,
        rep_address: &str,
        stop: &StopLrpInstance,
    ) -> CellClientResult<()>;
}

/// Plain HTTP/1 client, one connection per request.
#[derive(Debug, Clone)]
pub struct HttpCellClient {
    timeout: Duration,
}

impl HttpCellClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CellClient for HttpCellClient {
    async fn stop_lrp_instance(
        &self,
        rep_address: &str,
        stop: &StopLrpInstance,
    ) -> CellClientResult<()> {
        let body = serde_json::to_vec(stop).map_err(|e| CellClientError::Encode(e.to_string()))?;
        match tokio::time::timeout(self.timeout, post(rep_address, STOP_LRP_PATH, body)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%rep_address, "stop request timed out");
                Err(CellClientError::Timeout {
                    address: rep_address.to_string(),
                })
            }
        }
    }
}

async fn post(address: &str, path: &str, body: Vec<u8>) -> CellClientResult<()> {
    let uri = format!("http://{address}{path}");
    let connect_error = |reason: String| CellClientError::Connect {
        address: address.to_string(),
        reason,
    };

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| connect_error(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(http::header::HOST, address)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::USER_AGENT, "bulletin-converger/0.1")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| CellClientError::Encode(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    if resp.status().is_success() {
        debug!(%uri, "stop request accepted");
        Ok(())
    } else {
        debug!(status = %resp.status(), %uri, "stop request rejected");
        Err(CellClientError::Status {
            address: address.to_string(),
            status: resp.status().as_u16(),
        })
    }
}
