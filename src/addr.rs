use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Mutex;

// Resolver implementations have historically not been safe to call
// concurrently on every platform, so lookups are serialized process-wide.
static RESOLVE_LOCK: Mutex<()> = Mutex::new(());

/// An IPv4 `host:port` value.
///
/// Construction never fails: an `Addr` whose host did not parse or resolve
/// is marked invalid, reports port 0, and formats as `"invalid"`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    inner: Option<SocketAddrV4>,
}

impl Addr {
    /// The bind-any address, `0.0.0.0:port`.
    pub fn any(port: u16) -> Addr {
        Addr::from_std(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// Resolve `host`, trying a dotted-quad parse before a blocking DNS
    /// lookup. An empty host means bind-any.
    pub fn new(host: &str, port: u16) -> Addr {
        if host.is_empty() {
            return Addr::any(port);
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Addr::from_std(SocketAddrV4::new(ip, port));
        }

        let _guard = RESOLVE_LOCK.lock().unwrap();
        let resolved = (host, port).to_socket_addrs().ok().and_then(|mut addrs| {
            addrs.find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
        });
        Addr { inner: resolved }
    }

    pub fn from_std(addr: SocketAddrV4) -> Addr {
        Addr { inner: Some(addr) }
    }

    /// False when resolution failed or no IPv4 address was found.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.inner
            .map(|addr| *addr.ip())
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn port(&self) -> u16 {
        self.inner.map(|addr| addr.port()).unwrap_or(0)
    }

    pub fn to_std(&self) -> Option<SocketAddrV4> {
        self.inner
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("invalid"),
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_quad() {
        let addr = Addr::new("127.0.0.1", 8000);
        assert!(addr.is_valid());
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(addr.port(), 8000);
        assert_eq!(addr.to_string(), "127.0.0.1:8000");
    }

    #[test]
    fn bind_any() {
        let addr = Addr::any(80);
        assert!(addr.is_valid());
        assert_eq!(addr.to_string(), "0.0.0.0:80");
        assert_eq!(Addr::new("", 80), addr);
    }

    #[test]
    fn unresolvable_is_invalid() {
        let addr = Addr::new("host.invalid.", 80);
        assert!(!addr.is_valid());
        assert_eq!(addr.port(), 0);
        assert_eq!(addr.to_string(), "invalid");
    }
}
