//! Port allocation for debug servers.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;
use tracing::debug;

/// How many times to ask the OS for a fresh port before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Hands out OS-assigned ephemeral ports for debug-server sessions.
///
/// The OS guarantees a port obtained by binding port 0 is free at that
/// moment. The allocator additionally remembers ports it gave out so that two
/// sessions in the same process never race for one port between the probe
/// bind being dropped and the server binding it.
#[derive(Default)]
pub struct PortAllocator {
    /// Ports handed out and not yet released.
    used_ports: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a fresh ephemeral port from the OS.
    pub fn allocate(&self) -> io::Result<u16> {
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = find_free_port()?;
            if used.insert(port) {
                debug!(port, "Allocated ephemeral port");
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free ephemeral port available",
        ))
    }

    /// Reuse `configured` when allowed and non-zero, otherwise allocate.
    pub fn resolve(&self, configured: u16, reuse_configured: bool) -> io::Result<u16> {
        if reuse_configured && configured != 0 {
            let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
            used.insert(configured);
            debug!(port = configured, "Reusing configured port");
            return Ok(configured);
        }
        self.allocate()
    }

    /// Release a previously allocated port.
    pub fn release(&self, port: u16) {
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.remove(&port);
    }

    /// Number of ports currently handed out.
    pub fn allocated_count(&self) -> usize {
        let used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.len()
    }

    /// Whether `port` is currently handed out by this allocator.
    pub fn is_allocated(&self, port: u16) -> bool {
        let used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.contains(&port)
    }
}

/// Ask the OS for a currently free TCP port.
pub fn find_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Raw bind probe: `true` if binding `addr:port` fails.
pub fn port_in_use(addr: Ipv4Addr, port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(addr, port)).is_err()
}

/// A port is taken if it cannot be bound on loopback or the wildcard address.
pub fn port_occupied(port: u16) -> bool {
    port_in_use(Ipv4Addr::LOCALHOST, port) || port_in_use(Ipv4Addr::UNSPECIFIED, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let allocator = PortAllocator::new();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.allocated_count(), 2);
        assert!(allocator.is_allocated(a));

        allocator.release(a);
        assert!(!allocator.is_allocated(a));
        assert_eq!(allocator.allocated_count(), 1);
    }

    #[test]
    fn test_never_returns_port_held_by_listener() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let held = listener.local_addr().unwrap().port();

        let allocator = PortAllocator::new();
        for _ in 0..8 {
            let port = allocator.allocate().unwrap();
            assert_ne!(port, held);
        }
        // The held port really is unusable by an independent bind.
        assert!(port_occupied(held));
        drop(listener);
    }

    #[test]
    fn test_allocated_port_is_bindable() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().unwrap();
        let listener = TcpListener::bind(("0.0.0.0", port)).unwrap();
        // A second independent bind on the same port fails before use.
        assert!(TcpListener::bind(("0.0.0.0", port)).is_err());
        drop(listener);
    }

    #[test]
    fn test_resolve_reuses_configured_only_when_allowed() {
        let allocator = PortAllocator::new();
        assert_eq!(allocator.resolve(3333, true).unwrap(), 3333);
        assert!(allocator.is_allocated(3333));

        let fresh = allocator.resolve(3333, false).unwrap();
        assert_ne!(fresh, 0);
        assert!(allocator.is_allocated(fresh));

        let from_zero = allocator.resolve(0, true).unwrap();
        assert_ne!(from_zero, 0);
    }
}
