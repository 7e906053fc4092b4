use super::support::*;
use crate::connectivity::{IpProtocol, MappingProtocol};
use crate::net::{NatPacketListener, Network};
use crate::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

async fn bind_mapped(mapper: &Arc<MockPortMapper>) -> (NatPacketListener, u16) {
    let port = free_udp_port();
    let listener =
        NatPacketListener::bind(&mock_selector(mapper), port, &CancellationToken::new())
            .await
            .expect("Failed to bind mapped packet listener");
    (listener, port)
}

#[tokio::test]
async fn test_packet_listener_reports_mapped_address() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, port) = bind_mapped(&upnp).await;

    let addr = listener.addr();
    assert_eq!(addr.network(), Network::Udp);
    assert_eq!(addr.external_addr(), format!("203.0.113.7:{}", port));
    assert!(upnp.has_mapping(IpProtocol::UDP, port));
    assert!(!listener.is_fallback());

    listener.close().await.unwrap();
    assert_eq!(upnp.active_mappings(), 0);
}

#[tokio::test]
async fn test_accept_returns_cached_conn() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, _) = bind_mapped(&upnp).await;

    let first = listener.accept().await.unwrap();
    let second = listener.accept().await.unwrap();
    let third = listener.packet_conn();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(first.local_addr(), listener.addr());

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_packet_conn_send_and_receive() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, port) = bind_mapped(&upnp).await;
    let conn = listener.accept().await.unwrap();

    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    peer.send_to(b"hello", (Ipv4Addr::LOCALHOST, port))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let (len, from) = conn.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from, peer.local_addr().unwrap());

    conn.send_to(b"world", from).await.unwrap();
    let (len, _) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"world");

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_close_listener_then_conn() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, _) = bind_mapped(&upnp).await;
    let conn = listener.accept().await.unwrap();

    assert_ok!(listener.close().await);
    assert_ok!(conn.close().await);
    assert_ok!(listener.close().await);

    assert!(conn.is_closed());
    assert_eq!(upnp.unmap_calls(), 1);
    let mut buf = [0u8; 4];
    assert!(matches!(conn.recv_from(&mut buf).await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_conn_then_listener() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, _) = bind_mapped(&upnp).await;
    let conn = listener.accept().await.unwrap();

    assert_ok!(conn.close().await);
    assert!(matches!(listener.accept().await, Err(Error::Closed)));

    assert_ok!(listener.close().await);
    assert_ok!(conn.close().await);
    assert_eq!(upnp.active_mappings(), 0, "Listener close still releases the mapping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_listener_and_conn_close() {
    for _ in 0..10 {
        let upnp = MockPortMapper::new(MappingProtocol::UPnP);
        let (listener, port) = bind_mapped(&upnp).await;
        let listener = Arc::new(listener);
        let conn = listener.accept().await.unwrap();

        let closing_listener = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.close().await })
        };
        let closing_conn = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        };
        assert_ok!(closing_listener.await.unwrap());
        assert_ok!(closing_conn.await.unwrap());

        assert!(listener.is_closed());
        assert!(conn.is_closed());
        assert_eq!(upnp.unmap_calls(), 1);
        assert_eq!(upnp.unmapped_ports(), vec![port]);
        assert_eq!(upnp.active_mappings(), 0);
        assert!(matches!(listener.accept().await, Err(Error::Closed)));
    }
}

#[tokio::test]
async fn test_accept_after_close_fails() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, _) = bind_mapped(&upnp).await;

    listener.close().await.unwrap();
    assert!(matches!(listener.accept().await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_interrupts_pending_recv() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, _) = bind_mapped(&upnp).await;
    let conn = listener.accept().await.unwrap();

    let receiver = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            conn.recv_from(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    listener.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), receiver)
        .await
        .expect("Pending recv should return after close")
        .unwrap();
    assert!(matches!(result, Err(Error::Closed)));
}

#[tokio::test]
async fn test_port_change_updates_conn_address() {
    let upnp = MockPortMapper::new(MappingProtocol::UPnP);
    let (listener, _) = bind_mapped(&upnp).await;
    let conn = listener.accept().await.unwrap();

    upnp.set_next_port(48_000);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(listener.external_port(), 48_000);
    assert_eq!(conn.local_addr().external_addr(), "203.0.113.7:48000");
    assert_eq!(conn.local_addr(), listener.addr());

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_fallback_packet_listener() {
    let port = free_udp_port();
    let listener = NatPacketListener::bind_with_fallback(
        &unavailable_selector(),
        port,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(listener.is_fallback());
    let addr = listener.addr();
    assert_eq!(addr.internal_addr(), addr.external_addr());
    assert_eq!(
        addr.internal_addr(),
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).to_string()
    );

    let conn = listener.accept().await.unwrap();
    assert_eq!(conn.local_addr(), addr);
    listener.close().await.unwrap();
    assert!(conn.is_closed());
}
