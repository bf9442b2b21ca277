//! Local port allocation for the dev server

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Find a TCP port on the loopback interface that is currently unused.
///
/// The listener is dropped before returning, so another process may claim the
/// port before the dev server binds it.
pub fn find_available_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
