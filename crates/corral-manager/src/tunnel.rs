//! Tunneled transport for downstream API clients
//!
//! Downstream clusters are usually not routable from the management plane.
//! A [`Dialer`] hands back a byte stream that reaches the cluster's API
//! server through whatever tunnel the agent established; [`TunnelConnector`]
//! plugs that dialer into hyper as the connector under rustls, so the rest of
//! the kube client stack is unchanged.
//!
//! The connector bounds each dial, and every dialed stream fails a read that
//! sees no bytes within the read timeout. A tunnel that accepts connections
//! but never answers therefore surfaces as an error instead of a hang.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Sleep;

#[cfg(test)]
use mockall::automock;

use corral_common::Result;

/// Boxed error type used by the hyper/tower connector plumbing
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A bidirectional byte stream returned by a dialer
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens connections to one downstream cluster
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `authority` (`host:port`) as seen from inside the cluster's network
    async fn dial(&self, authority: &str) -> io::Result<Box<dyn TunnelIo>>;
}

/// Hands out per-cluster dialers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DialerFactory: Send + Sync {
    /// Dialer for the named cluster; fails when no tunnel session exists
    async fn cluster_dialer(&self, cluster_name: &str) -> Result<Arc<dyn Dialer>>;
}

/// Dialer that connects straight over TCP
///
/// For clusters whose API server is routable from the management plane.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, authority: &str) -> io::Result<Box<dyn TunnelIo>> {
        let stream = tokio::net::TcpStream::connect(authority).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Factory handing every cluster a [`DirectDialer`]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectDialerFactory;

#[async_trait]
impl DialerFactory for DirectDialerFactory {
    async fn cluster_dialer(&self, _cluster_name: &str) -> Result<Arc<dyn Dialer>> {
        Ok(Arc::new(DirectDialer))
    }
}

/// hyper connector that dials through a [`Dialer`]
#[derive(Clone)]
pub struct TunnelConnector {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    read_timeout: Option<Duration>,
}

impl TunnelConnector {
    /// Wrap a dialer; every dial is bounded by `dial_timeout`
    pub fn new(dialer: Arc<dyn Dialer>, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            dial_timeout,
            read_timeout: None,
        }
    }

    /// Fail reads on dialed streams that stay silent for `timeout`
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for TunnelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnector")
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

/// `host:port` for a URI, defaulting the port from the scheme
pub fn authority_for(uri: &http::Uri) -> io::Result<String> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {uri}")))?;
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("http")) => 80,
        (None, _) => 443,
    };
    Ok(format!("{host}:{port}"))
}

impl tower::Service<http::Uri> for TunnelConnector {
    type Response = TunnelStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<TunnelStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: http::Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        let dial_timeout = self.dial_timeout;
        let read_timeout = self.read_timeout;
        Box::pin(async move {
            let authority = authority_for(&uri)?;
            let io = tokio::time::timeout(dial_timeout, dialer.dial(&authority))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial {authority} timed out after {dial_timeout:?}"),
                    )
                })??;
            Ok(TunnelStream::new(io, read_timeout))
        })
    }
}

/// A dialed stream adapted to hyper's IO traits
pub struct TunnelStream {
    inner: TokioIo<Box<dyn TunnelIo>>,
    read_timeout: Option<Duration>,
    // Armed while a read is pending, cleared once it completes
    read_deadline: Option<Pin<Box<Sleep>>>,
}

impl TunnelStream {
    fn new(io: Box<dyn TunnelIo>, read_timeout: Option<Duration>) -> Self {
        Self {
            inner: TokioIo::new(io),
            read_timeout,
            read_deadline: None,
        }
    }
}

impl Connection for TunnelStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(result) = hyper::rt::Read::poll_read(Pin::new(&mut this.inner), cx, buf) {
            this.read_deadline = None;
            return Poll::Ready(result);
        }

        let Some(timeout) = this.read_timeout else {
            return Poll::Pending;
        };
        let deadline = this
            .read_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.read_deadline = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data from tunnel within {timeout:?}"),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl hyper::rt::Write for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().inner), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().inner), cx)
    }
}
