//! TCP listener with automatic port mapping

use super::addr::{NatAddr, Network};
use super::close::CloseOnce;
use super::{ensure_not_cancelled, query_external_ip};
use crate::connectivity::mapper::release_mapping;
use crate::connectivity::{
    classify_external_ip, AcquiredMapping, IpProtocol, PortMapperSelector, RenewalManager,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mutable view of the mapping, shared with the renewal callback
#[derive(Debug)]
struct ListenerState {
    external_ip: Option<IpAddr>,
    external_port: u16,
    addr: NatAddr,
}

/// A TCP listener reachable from outside the NAT.
///
/// Holds the port mapping for as long as it is open and renews it in the
/// background. If the router moves the mapping to another external port,
/// [`addr`](Self::addr) and [`external_port`](Self::external_port) follow.
pub struct NatListener {
    socket: CloseOnce<TcpListener>,
    local_addr: SocketAddr,
    renewal: Option<RenewalManager>,
    state: Arc<Mutex<ListenerState>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for NatListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatListener")
            .field("local_addr", &self.local_addr)
            .field("addr", &self.addr())
            .field("fallback", &self.is_fallback())
            .finish()
    }
}

impl NatListener {
    /// Map `port` through the selector, then listen on it
    ///
    /// The token only governs construction; once this returns, use
    /// [`close`](Self::close) to shut the listener down.
    pub async fn bind(
        selector: &PortMapperSelector,
        port: u16,
        token: &CancellationToken,
    ) -> Result<Self> {
        ensure_not_cancelled(token)?;

        let acquired = selector.acquire(IpProtocol::TCP, port, token).await?;
        let mapper = acquired.mapper.clone();
        let external_port = acquired.external_port;

        match Self::bind_mapped(selector, port, acquired, token).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                release_mapping(mapper, IpProtocol::TCP, external_port).await;
                Err(e)
            }
        }
    }

    /// Like [`bind`](Self::bind), but listen without a mapping if NAT traversal fails
    ///
    /// Cancellation is still reported as an error.
    pub async fn bind_with_fallback(
        selector: &PortMapperSelector,
        port: u16,
        token: &CancellationToken,
    ) -> Result<Self> {
        match Self::bind(selector, port, token).await {
            Ok(listener) => Ok(listener),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(
                    "NAT traversal unavailable for TCP port {} ({}), listening without a mapping",
                    port, e
                );
                Self::bind_direct(port).await
            }
        }
    }

    async fn bind_mapped(
        selector: &PortMapperSelector,
        port: u16,
        acquired: AcquiredMapping,
        token: &CancellationToken,
    ) -> Result<Self> {
        ensure_not_cancelled(token)?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        ensure_not_cancelled(token)?;

        let local_addr = listener.local_addr()?;
        let external_ip = query_external_ip(&acquired.mapper).await?;
        classify_external_ip(external_ip);

        let external_port = acquired.external_port;
        let state = Arc::new(Mutex::new(ListenerState {
            external_ip: Some(external_ip),
            external_port,
            addr: NatAddr::mapped(Network::Tcp, local_addr, external_ip, external_port),
        }));

        let renewal = RenewalManager::new(
            acquired.mapper,
            IpProtocol::TCP,
            port,
            external_port,
            selector.config(),
        )?;
        let callback_state = state.clone();
        renewal.set_port_change_callback(move |new_port| {
            let mut state = callback_state.lock();
            state.external_port = new_port;
            state.addr = NatAddr::mapped(Network::Tcp, local_addr, external_ip, new_port);
        });
        renewal.start();

        info!(
            "Listening on {} via {} (external {}:{})",
            local_addr, acquired.protocol, external_ip, external_port
        );

        Ok(Self {
            socket: CloseOnce::new(listener),
            local_addr,
            renewal: Some(renewal),
            state,
            closed: AtomicBool::new(false),
        })
    }

    async fn bind_direct(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = listener.local_addr()?;

        info!("Listening on {} without a port mapping", local_addr);

        Ok(Self {
            socket: CloseOnce::new(listener),
            local_addr,
            renewal: None,
            state: Arc::new(Mutex::new(ListenerState {
                external_ip: None,
                external_port: local_addr.port(),
                addr: NatAddr::direct(Network::Tcp, local_addr),
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next inbound connection
    ///
    /// Fails with [`Error::Closed`] once the listener is closed, including
    /// while an accept is pending.
    pub async fn accept(&self) -> Result<NatStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let listener = self.socket.acquire().await?;
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = self.socket.closed() => return Err(Error::Closed),
        };

        Ok(NatStream {
            stream,
            local_addr: self.addr(),
            peer_addr,
        })
    }

    /// Stop renewal (releasing the mapping) and close the socket
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(renewal) = &self.renewal {
            renewal.stop().await;
        }
        self.socket.close().await;

        info!("Closed listener on {}", self.local_addr);
        Ok(())
    }

    /// Current NAT address, reflecting the latest external port
    pub fn addr(&self) -> NatAddr {
        self.state.lock().addr.clone()
    }

    /// Current external port
    pub fn external_port(&self) -> u16 {
        self.state.lock().external_port
    }

    /// External IP reported by the router, `None` for a fallback listener
    pub fn external_ip(&self) -> Option<IpAddr> {
        self.state.lock().external_ip
    }

    /// Address of the bound socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether this listener runs without a port mapping
    pub fn is_fallback(&self) -> bool {
        self.renewal.is_none()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// An accepted connection that reports the listener's NAT address as its local address
#[derive(Debug)]
pub struct NatStream {
    stream: TcpStream,
    local_addr: NatAddr,
    peer_addr: SocketAddr,
}

impl NatStream {
    /// NAT address of the listener at accept time
    pub fn local_addr(&self) -> &NatAddr {
        &self.local_addr
    }

    /// Remote peer
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Wrapped stream
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    /// Mutable access to the wrapped stream
    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Unwrap into the underlying stream
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl AsyncRead for NatStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for NatStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
