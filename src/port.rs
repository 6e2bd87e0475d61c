//! Free port discovery for the sandbox process

use crate::error::SandboxError;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::debug;

/// Find the first port at or above `start` that can be bound on all interfaces.
///
/// Ports in use are skipped; any other bind failure aborts the search. The probe
/// listener is dropped before returning, so the port is only likely free.
pub async fn find_available_port(start: u16, attempts: u32) -> Result<u16, SandboxError> {
    let mut port = start;

    for _ in 0..attempts {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(listener) => {
                drop(listener);
                debug!(port, "Found available port");
                return Ok(port);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port, "Port in use, trying next");
            }
            Err(e) => return Err(SandboxError::PortProbe { port, source: e }),
        }

        port = match port.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    Err(SandboxError::PortExhausted { start, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_free_start_port_is_returned() {
        let port = free_port().await;
        assert_eq!(find_available_port(port, 10).await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_occupied_port_is_skipped() {
        let held = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }

        let found = find_available_port(port, 50).await.unwrap();
        assert!(found > port);
        drop(held);
    }

    #[tokio::test]
    async fn test_exhausted_when_every_attempt_is_taken() {
        let held = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let err = find_available_port(port, 1).await.unwrap_err();
        assert!(matches!(err, SandboxError::PortExhausted { attempts: 1, .. }));
    }
}
