use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::pool::{validate_prefix, PoolError};

/// Parse a CIDR prefix after the same syntax checks the pool calculator applies.
pub fn parse_prefix(prefix: &str) -> Result<Ipv6Net, PoolError> {
    validate_prefix(prefix)?;
    prefix
        .trim()
        .parse::<Ipv6Net>()
        .map_err(|_| PoolError::InvalidPrefix(prefix.trim().to_string()))
}

pub fn parse_address(address: &str) -> Result<Ipv6Addr, PoolError> {
    address
        .trim()
        .parse()
        .map_err(|_| PoolError::InvalidAddress(address.trim().to_string()))
}

/// Two prefixes overlap when their networks agree on the shorter prefix length,
/// i.e. one contains the other. Host bits in either address are ignored.
pub fn prefixes_overlap(a: &Ipv6Net, b: &Ipv6Net) -> bool {
    let len = a.prefix_len().min(b.prefix_len());
    match (Ipv6Net::new(a.addr(), len), Ipv6Net::new(b.addr(), len)) {
        (Ok(x), Ok(y)) => x.trunc() == y.trunc(),
        _ => false,
    }
}
