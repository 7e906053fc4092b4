//! UDP listener with automatic port mapping

use super::addr::{NatAddr, Network};
use super::close::CloseOnce;
use super::{ensure_not_cancelled, query_external_ip};
use crate::connectivity::mapper::release_mapping;
use crate::connectivity::{
    classify_external_ip, AcquiredMapping, IpProtocol, PortMapperSelector, RenewalManager,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
struct PacketState {
    external_ip: Option<IpAddr>,
    external_port: u16,
    addr: NatAddr,
    conn: Option<Arc<NatPacketConn>>,
}

impl PacketState {
    fn conn(&mut self, socket: &Arc<CloseOnce<UdpSocket>>) -> Arc<NatPacketConn> {
        let addr = self.addr.clone();
        self.conn
            .get_or_insert_with(|| {
                Arc::new(NatPacketConn {
                    socket: socket.clone(),
                    local_addr: Mutex::new(addr),
                })
            })
            .clone()
    }
}

/// A UDP socket reachable from outside the NAT, exposed through a listener interface.
///
/// UDP has no connections to accept, so [`accept`](Self::accept) hands out
/// the same [`NatPacketConn`] every time. Closing either the listener or the
/// connection closes the socket once.
pub struct NatPacketListener {
    socket: Arc<CloseOnce<UdpSocket>>,
    local_addr: SocketAddr,
    renewal: Option<RenewalManager>,
    state: Arc<Mutex<PacketState>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for NatPacketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatPacketListener")
            .field("local_addr", &self.local_addr)
            .field("addr", &self.addr())
            .field("fallback", &self.is_fallback())
            .finish()
    }
}

impl NatPacketListener {
    /// Map `port` through the selector, then bind a UDP socket on it
    pub async fn bind(
        selector: &PortMapperSelector,
        port: u16,
        token: &CancellationToken,
    ) -> Result<Self> {
        ensure_not_cancelled(token)?;

        let acquired = selector.acquire(IpProtocol::UDP, port, token).await?;
        let mapper = acquired.mapper.clone();
        let external_port = acquired.external_port;

        match Self::bind_mapped(selector, port, acquired, token).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                release_mapping(mapper, IpProtocol::UDP, external_port).await;
                Err(e)
            }
        }
    }

    /// Like [`bind`](Self::bind), but bind without a mapping if NAT traversal fails
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
                    "NAT traversal unavailable for UDP port {} ({}), binding without a mapping",
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
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        ensure_not_cancelled(token)?;

        let local_addr = socket.local_addr()?;
        let external_ip = query_external_ip(&acquired.mapper).await?;
        classify_external_ip(external_ip);

        let external_port = acquired.external_port;
        let state = Arc::new(Mutex::new(PacketState {
            external_ip: Some(external_ip),
            external_port,
            addr: NatAddr::mapped(Network::Udp, local_addr, external_ip, external_port),
            conn: None,
        }));

        let renewal = RenewalManager::new(
            acquired.mapper,
            IpProtocol::UDP,
            port,
            external_port,
            selector.config(),
        )?;
        let callback_state = state.clone();
        renewal.set_port_change_callback(move |new_port| {
            let mut state = callback_state.lock();
            let addr = NatAddr::mapped(Network::Udp, local_addr, external_ip, new_port);
            if let Some(conn) = &state.conn {
                conn.set_local_addr(addr.clone());
            }
            state.external_port = new_port;
            state.addr = addr;
        });
        renewal.start();

        info!(
            "Bound UDP {} via {} (external {}:{})",
            local_addr, acquired.protocol, external_ip, external_port
        );

        Ok(Self {
            socket: Arc::new(CloseOnce::new(socket)),
            local_addr,
            renewal: Some(renewal),
            state,
            closed: AtomicBool::new(false),
        })
    }

    async fn bind_direct(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;

        info!("Bound UDP {} without a port mapping", local_addr);

        Ok(Self {
            socket: Arc::new(CloseOnce::new(socket)),
            local_addr,
            renewal: None,
            state: Arc::new(Mutex::new(PacketState {
                external_ip: None,
                external_port: local_addr.port(),
                addr: NatAddr::direct(Network::Udp, local_addr),
                conn: None,
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// Return the packet connection, creating it on first use
    ///
    /// Every call returns the same connection. Fails once the listener is closed.
    pub async fn accept(&self) -> Result<Arc<NatPacketConn>> {
        if self.closed.load(Ordering::Acquire) || self.socket.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.state.lock().conn(&self.socket))
    }

    /// The packet connection, without the closed check
    pub fn packet_conn(&self) -> Arc<NatPacketConn> {
        self.state.lock().conn(&self.socket)
    }

    /// Stop renewal (releasing the mapping) and close the socket
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(renewal) = &self.renewal {
            renewal.stop().await;
        }

        let conn = self.state.lock().conn.clone();
        match conn {
            Some(conn) => conn.close().await?,
            None => {
                self.socket.close().await;
            }
        }

        info!("Closed UDP listener on {}", self.local_addr);
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

    /// External IP reported by the router, `None` without a mapping
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

/// Datagram connection whose local address is the NAT address
#[derive(Debug)]
pub struct NatPacketConn {
    socket: Arc<CloseOnce<UdpSocket>>,
    local_addr: Mutex<NatAddr>,
}

impl NatPacketConn {
    /// Receive one datagram
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let socket = self.socket.acquire().await?;
        tokio::select! {
            received = socket.recv_from(buf) => Ok(received?),
            _ = self.socket.closed() => Err(Error::Closed),
        }
    }

    /// Send one datagram to `target`
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        let socket = self.socket.acquire().await?;
        tokio::select! {
            sent = socket.send_to(buf, target) => Ok(sent?),
            _ = self.socket.closed() => Err(Error::Closed),
        }
    }

    /// Current NAT address
    pub fn local_addr(&self) -> NatAddr {
        self.local_addr.lock().clone()
    }

    pub(crate) fn set_local_addr(&self, addr: NatAddr) {
        *self.local_addr.lock() = addr;
    }

    /// Close the shared socket; later calls from here or the listener are no-ops
    pub async fn close(&self) -> Result<()> {
        self.socket.close().await;
        Ok(())
    }

    /// Whether the shared socket has been closed
    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}
