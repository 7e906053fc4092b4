// Shared fixtures: an in-memory router and helpers to wire it into selectors

use crate::config::NatConfig;
use crate::connectivity::mapper::validate_port;
use crate::connectivity::upnp::{AddPortFailure, IgdClient};
use crate::connectivity::{
    Discoverer, IpProtocol, MappingError, MappingProtocol, PortMapper, PortMapperSelector,
    SharedMapper,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Public address every mock router reports
pub(crate) const MOCK_EXTERNAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

/// How the mock router picks external ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NatBehavior {
    /// Same external port as internal, stable across renewals
    FullCone,
    /// A fresh external port for every request
    Symmetric,
}

#[derive(Debug, Default)]
struct RouterState {
    /// (protocol, external port) -> internal port
    mappings: HashMap<(IpProtocol, u16), u16>,
    fail_map: bool,
    fail_unmap: bool,
    fail_external_ip: bool,
    next_port: Option<u16>,
    port_counter: u16,
    map_delay: Option<Duration>,
    /// External ports in the order they were unmapped
    unmapped: Vec<u16>,
}

/// Router stand-in with a mapping table
#[derive(Debug)]
pub(crate) struct MockPortMapper {
    protocol: MappingProtocol,
    behavior: NatBehavior,
    state: Mutex<RouterState>,
    map_calls: AtomicUsize,
    unmap_calls: AtomicUsize,
}

impl MockPortMapper {
    pub(crate) fn new(protocol: MappingProtocol) -> Arc<Self> {
        Self::with_behavior(protocol, NatBehavior::FullCone)
    }

    pub(crate) fn with_behavior(protocol: MappingProtocol, behavior: NatBehavior) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            behavior,
            state: Mutex::new(RouterState {
                port_counter: 40_000,
                ..RouterState::default()
            }),
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_fail_map(&self, fail: bool) {
        self.state.lock().fail_map = fail;
    }

    pub(crate) fn set_fail_unmap(&self, fail: bool) {
        self.state.lock().fail_unmap = fail;
    }

    pub(crate) fn set_fail_external_ip(&self, fail: bool) {
        self.state.lock().fail_external_ip = fail;
    }

    /// Hand out `port` on the next map request, as a router would after a reboot
    pub(crate) fn set_next_port(&self, port: u16) {
        self.state.lock().next_port = Some(port);
    }

    /// Make every map request take `delay`, like a slow router
    pub(crate) fn set_map_delay(&self, delay: Duration) {
        self.state.lock().map_delay = Some(delay);
    }

    pub(crate) fn unmapped_ports(&self) -> Vec<u16> {
        self.state.lock().unmapped.clone()
    }

    pub(crate) fn active_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    pub(crate) fn has_mapping(&self, protocol: IpProtocol, external_port: u16) -> bool {
        self.state
            .lock()
            .mappings
            .contains_key(&(protocol, external_port))
    }

    pub(crate) fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::SeqCst)
    }
}

impl PortMapper for MockPortMapper {
    fn protocol(&self) -> MappingProtocol {
        self.protocol
    }

    fn map_port(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
        _lease: Duration,
    ) -> Result<u16, MappingError> {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        validate_port(internal_port)?;

        let delay = self.state.lock().map_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if state.fail_map {
            return Err(MappingError::GatewayError("mapping refused".to_string()));
        }

        let existing = state
            .mappings
            .iter()
            .find(|((p, _), internal)| *p == protocol && **internal == internal_port)
            .map(|((_, external), _)| *external);

        let external_port = match (state.next_port.take(), self.behavior) {
            (Some(forced), _) => forced,
            (None, NatBehavior::FullCone) => existing.unwrap_or(internal_port),
            (None, NatBehavior::Symmetric) => {
                state.port_counter += 1;
                state.port_counter
            }
        };

        if let Some(old) = existing {
            state.mappings.remove(&(protocol, old));
        }
        state.mappings.insert((protocol, external_port), internal_port);
        Ok(external_port)
    }

    fn unmap_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError> {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.fail_unmap {
            return Err(MappingError::GatewayError("unmap refused".to_string()));
        }
        state.unmapped.push(external_port);
        state.mappings.remove(&(protocol, external_port));
        Ok(())
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        if self.state.lock().fail_external_ip {
            return Err(MappingError::Timeout);
        }
        Ok(MOCK_EXTERNAL_IP)
    }
}

/// Address the fake IGD reports for the local host
pub(crate) const FAKE_LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

/// Another host on the LAN that already holds some ports
pub(crate) const OTHER_HOST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 99);

#[derive(Debug)]
struct IgdState {
    /// (protocol, external port) -> client the port forwards to
    mappings: HashMap<(IpProtocol, u16), SocketAddr>,
    next_any_port: u16,
    add_any_calls: usize,
    last_lifetime_secs: Option<u32>,
}

/// IGD stand-in: refuses external ports owned by another client, and
/// AddAnyPortMapping hands out a fresh port every time it is called
#[derive(Debug, Clone)]
pub(crate) struct FakeIgd {
    state: Arc<Mutex<IgdState>>,
}

impl FakeIgd {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IgdState {
                mappings: HashMap::new(),
                next_any_port: 50_000,
                add_any_calls: 0,
                last_lifetime_secs: None,
            })),
        }
    }

    /// Give `port` to another host on the LAN
    pub(crate) fn occupy(&self, protocol: IpProtocol, port: u16) {
        self.state
            .lock()
            .mappings
            .insert((protocol, port), SocketAddr::from((OTHER_HOST_IP, port)));
    }

    /// External ports forwarding to `client`, sorted
    pub(crate) fn ports_for(&self, client: Ipv4Addr) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .state
            .lock()
            .mappings
            .iter()
            .filter(|(_, addr)| addr.ip() == IpAddr::V4(client))
            .map(|((_, port), _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub(crate) fn add_any_calls(&self) -> usize {
        self.state.lock().add_any_calls
    }

    pub(crate) fn last_lifetime_secs(&self) -> Option<u32> {
        self.state.lock().last_lifetime_secs
    }
}

impl IgdClient for FakeIgd {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(192, 168, 1, 1), 5000))
    }

    fn add_port(
        &self,
        protocol: IpProtocol,
        external_port: u16,
        local_addr: SocketAddr,
        lifetime_secs: u32,
    ) -> Result<(), AddPortFailure> {
        let mut state = self.state.lock();
        state.last_lifetime_secs = Some(lifetime_secs);
        match state.mappings.get(&(protocol, external_port)) {
            Some(owner) if *owner != local_addr => Err(AddPortFailure::PortInUse),
            _ => {
                state.mappings.insert((protocol, external_port), local_addr);
                Ok(())
            }
        }
    }

    fn add_any_port(
        &self,
        protocol: IpProtocol,
        local_addr: SocketAddr,
        lifetime_secs: u32,
    ) -> Result<u16, MappingError> {
        let mut state = self.state.lock();
        state.add_any_calls += 1;
        state.last_lifetime_secs = Some(lifetime_secs);
        loop {
            state.next_any_port += 1;
            let port = state.next_any_port;
            if !state.mappings.contains_key(&(protocol, port)) {
                state.mappings.insert((protocol, port), local_addr);
                return Ok(port);
            }
        }
    }

    fn remove_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError> {
        match self.state.lock().mappings.remove(&(protocol, external_port)) {
            Some(_) => Ok(()),
            None => Err(MappingError::GatewayError("NoSuchEntryInArray".to_string())),
        }
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        Ok(MOCK_EXTERNAL_IP)
    }
}

/// Discoverer that always finds `mapper`
pub(crate) fn mock_discoverer(mapper: &Arc<MockPortMapper>) -> Discoverer {
    let mapper = mapper.clone();
    Discoverer::new(mapper.protocol(), move || Ok(mapper.clone() as SharedMapper))
}

/// Discoverer that never finds a device
pub(crate) fn failing_discoverer(protocol: MappingProtocol) -> Discoverer {
    Discoverer::new(protocol, || Err(MappingError::NoGateway))
}

/// Discoverer that takes `delay` to find `mapper`
pub(crate) fn slow_discoverer(mapper: &Arc<MockPortMapper>, delay: Duration) -> Discoverer {
    let mapper = mapper.clone();
    Discoverer::new(mapper.protocol(), move || {
        std::thread::sleep(delay);
        Ok(mapper.clone() as SharedMapper)
    })
}

/// Renewal every 50ms so tests can observe several ticks
pub(crate) fn fast_config() -> NatConfig {
    NatConfig::with_renewal_interval(Duration::from_millis(50))
}

/// Selector whose UPnP side is backed by `mapper` and whose NAT-PMP side finds nothing
pub(crate) fn mock_selector(mapper: &Arc<MockPortMapper>) -> PortMapperSelector {
    PortMapperSelector::with_discoverers(
        fast_config(),
        mock_discoverer(mapper),
        failing_discoverer(MappingProtocol::NATPMP),
    )
    .expect("Test config is valid")
}

/// Selector where neither protocol finds a device
pub(crate) fn unavailable_selector() -> PortMapperSelector {
    PortMapperSelector::with_discoverers(
        fast_config(),
        failing_discoverer(MappingProtocol::UPnP),
        failing_discoverer(MappingProtocol::NATPMP),
    )
    .expect("Test config is valid")
}

/// A TCP port that was free a moment ago
pub(crate) fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free TCP port")
}

/// A UDP port that was free a moment ago
pub(crate) fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free UDP port")
}
