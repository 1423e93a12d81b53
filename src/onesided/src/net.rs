use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Resolve `host` through the system resolver, preferring an IPv4 address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid address or hostname {:?}: {}", host, e)))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Config(format!("{:?} resolved to no address", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses() -> Result<()> {
        assert_eq!(resolve("127.0.0.1", 20886)?, "127.0.0.1:20886".parse().unwrap());
        assert_eq!(resolve("0.0.0.0", 1)?, "0.0.0.0:1".parse().unwrap());
        assert!(resolve("::1", 7)?.is_ipv6());
        Ok(())
    }
}
