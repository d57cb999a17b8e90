//! Local networking helpers.

use std::net::{Ipv4Addr, TcpListener, UdpSocket};

use crate::prelude::*;

/// Ask the OS for a free TCP port, then release it immediately so the
/// developer's service can bind it.
///
/// We bind the unspecified address so that the port is free on every local
/// interface, including the one the cluster will connect to.
pub fn allocate_local_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .context("failed to find an available local port")?;
    let port = listener
        .local_addr()
        .context("failed to read the allocated local port")?
        .port();
    drop(listener);
    Ok(port)
}

/// Find the address this machine uses to reach the outside world. This is
/// the address pods will connect to when we substitute a service.
///
/// No packets are sent: connecting a UDP socket only selects a route.
pub fn outbound_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .context("unable to open a UDP socket")?;
    socket
        .connect(("8.8.8.8", 80))
        .context("unable to determine outbound IP")?;
    Ok(socket.local_addr()?.ip())
}

#[test]
fn allocated_port_is_free_and_unprivileged() {
    let port = allocate_local_port().expect("could not allocate port");
    assert!(port >= 1024);
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).expect("allocated port is in use");
}
