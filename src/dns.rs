use std::io;
use std::net::{IpAddr, ToSocketAddrs};

/// Hostname resolution used by route selection.
pub trait Dns: Send + Sync {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

impl<F> Dns for F
where
    F: Fn(&str) -> io::Result<Vec<IpAddr>> + Send + Sync,
{
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self(host)
    }
}

/// Resolver backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut addresses = Vec::new();
        for socket_addr in (host, 0).to_socket_addrs()? {
            let ip = socket_addr.ip();
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
        Ok(addresses)
    }
}

/// IP literals bypass the resolver. Bracketed IPv6 hosts are accepted.
pub(crate) fn resolve(dns: &dyn Dns, host: &str) -> io::Result<Vec<IpAddr>> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let addresses = dns.lookup(host)?;
    if addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        ));
    }
    Ok(addresses)
}
