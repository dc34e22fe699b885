//! Node communication transport.
//!
//! The agent talks to node agents (and back to allocating clients)
//! through this seam. The TCP implementation frames every message with
//! an explicit u32 length prefix; tests substitute a mock.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::codec::forward::{ForwardSpec, ReturnItem};
use crate::codec::header::{decode_frame, encode_frame};
use crate::codec::msg::Message;
use crate::error::{SchedError, SchedResult};

/// Largest frame we will read from a peer.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Deliver `msg` to `addr` (forwarding the rest of the subgroup via
    /// `forward`) and collect one return item per reached node. The
    /// proxy's own verdict is reported under `proxy_name`.
    async fn send_recv(
        &self,
        addr: SocketAddrV4,
        proxy_name: &str,
        msg: &Message,
        forward: ForwardSpec,
        timeout: Duration,
    ) -> SchedResult<Vec<ReturnItem>>;

    /// Fire-and-forget delivery (shutdown, reconfigure).
    async fn send_only(&self, addr: SocketAddrV4, msg: &Message) -> SchedResult<()>;
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, frame: &[u8]) -> SchedResult<()> {
    w.write_u32(frame.len() as u32)
        .await
        .map_err(|e| SchedError::Comm(e.to_string()))?;
    w.write_all(frame)
        .await
        .map_err(|e| SchedError::Comm(e.to_string()))?;
    w.flush().await.map_err(|e| SchedError::Comm(e.to_string()))
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> SchedResult<Vec<u8>> {
    let len = r
        .read_u32()
        .await
        .map_err(|e| SchedError::Comm(e.to_string()))?;
    if len == 0 || len > MAX_FRAME {
        return Err(SchedError::Decode(format!("bad frame length {}", len)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| SchedError::Comm(e.to_string()))?;
    Ok(buf)
}

/// Real TCP transport to node agents.
pub struct TcpTransport;

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn send_recv(
        &self,
        addr: SocketAddrV4,
        proxy_name: &str,
        msg: &Message,
        forward: ForwardSpec,
        timeout: Duration,
    ) -> SchedResult<Vec<ReturnItem>> {
        let io = async {
            let mut stream = TcpStream::connect(SocketAddr::V4(addr))
                .await
                .map_err(|e| SchedError::Comm(format!("connect {}: {}", addr, e)))?;
            let frame = encode_frame(msg, forward, addr);
            write_frame(&mut stream, &frame).await?;
            let reply = read_frame(&mut stream).await?;
            let (header, body) = decode_frame(&reply)?;

            // The proxy's own verdict is the reply body; descendants
            // ride in the header's return list.
            let own_rc = match &body {
                Message::ResponseReturnCode(rc) => rc.return_code,
                _ => 0,
            };
            let mut items = vec![ReturnItem {
                err: own_rc,
                msg_type: body.msg_type(),
                node_name: proxy_name.to_string(),
                body: Some(Box::new(body)),
            }];
            items.extend(header.ret_list);
            Ok(items)
        };
        tokio::time::timeout(timeout, io)
            .await
            .map_err(|_| SchedError::Comm(format!("timeout talking to {}", addr)))?
    }

    async fn send_only(&self, addr: SocketAddrV4, msg: &Message) -> SchedResult<()> {
        let mut stream = TcpStream::connect(SocketAddr::V4(addr))
            .await
            .map_err(|e| SchedError::Comm(format!("connect {}: {}", addr, e)))?;
        let frame = encode_frame(msg, ForwardSpec::default(), addr);
        write_frame(&mut stream, &frame).await
    }
}
