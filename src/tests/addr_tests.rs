use crate::net::{NatAddr, Network};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[test]
fn test_network_names() {
    assert_eq!(Network::Tcp.to_string(), "tcp");
    assert_eq!(Network::Udp.as_str(), "udp");
}

#[test]
fn test_direct_addr_has_equal_endpoints() {
    let local = SocketAddr::from((Ipv4Addr::new(192, 168, 1, 50), 9000));
    let addr = NatAddr::direct(Network::Tcp, local);

    assert_eq!(addr.internal_addr(), "192.168.1.50:9000");
    assert_eq!(addr.internal_addr(), addr.external_addr());
}

#[test]
fn test_mapped_addr_displays_external() {
    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000));
    let external = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
    let addr = NatAddr::mapped(Network::Udp, local, external, 41000);

    assert_eq!(addr.network(), Network::Udp);
    assert_eq!(addr.internal_addr(), "0.0.0.0:9000");
    assert_eq!(addr.to_string(), "203.0.113.7:41000");
}

#[test]
fn test_nat_addr_serialization() {
    let addr = NatAddr::new(Network::Tcp, "10.0.0.2:80", "198.51.100.1:8080");

    let json = serde_json::to_string(&addr).expect("Failed to serialize");
    assert!(json.contains("\"network\":\"Tcp\""));
    assert!(json.contains("198.51.100.1:8080"));

    let back: NatAddr = serde_json::from_str(&json).expect("Failed to deserialize");
    assert_eq!(back, addr);
}
