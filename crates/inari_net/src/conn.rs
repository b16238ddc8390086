use parking_lot::Mutex;
use tokio::net::TcpStream;

use inari_types::RegionDescriptor;

use crate::error::{NetError, NetResult};
use crate::wire::{self, Request, Response};

/// Client side of one connection to a node.
///
/// Requests are strictly serial per connection, matching the in-order
/// completion guarantee the transport gives us. Unsolicited resize
/// notifications may arrive between a request and its response; they are
/// stashed and picked up by the owner via [`take_resize`].
///
/// [`take_resize`]: Connection::take_resize
pub struct Connection {
    io: tokio::sync::Mutex<TcpStream>,
    resize: Mutex<Option<RegionDescriptor>>,
    peer: String,
}

impl Connection {
    pub async fn connect(host: &str, port: &str) -> NetResult<Self> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect(&peer).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "connected");
        Ok(Self {
            io: tokio::sync::Mutex::new(stream),
            resize: Mutex::new(None),
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send a request and await its response.
    pub async fn request(&self, req: &Request) -> NetResult<Response> {
        let mut io = self.io.lock().await;
        wire::write_frame(&mut *io, &req.encode()).await?;
        loop {
            let frame = wire::read_frame(&mut *io).await?;
            match Response::decode(&frame)? {
                Response::Resize { info } => {
                    tracing::debug!(peer = %self.peer, "resize notification");
                    *self.resize.lock() = Some(info);
                }
                resp => return Ok(resp),
            }
        }
    }

    /// Send a request that has no response (disconnect, overlay updates
    /// pushed to peers).
    pub async fn send(&self, req: &Request) -> NetResult<()> {
        let mut io = self.io.lock().await;
        wire::write_frame(&mut *io, &req.encode()).await
    }

    /// The most recent unhandled resize notification, if any.
    pub fn take_resize(&self) -> Option<RegionDescriptor> {
        self.resize.lock().take()
    }

    /// Courtesy disconnect; errors are ignored since the peer may already
    /// be gone.
    pub async fn close(&self) {
        if let Err(e) = self.send(&Request::Disconnect).await {
            tracing::trace!(peer = %self.peer, "disconnect send failed: {e}");
        }
    }

    /// Expect an ack and surface it as a bool.
    pub async fn request_ack(&self, req: &Request) -> NetResult<bool> {
        match self.request(req).await? {
            Response::Ack { success } => Ok(success),
            other => Err(NetError::InvalidFrame(format!(
                "expected ack, got {other:?}"
            ))),
        }
    }
}
