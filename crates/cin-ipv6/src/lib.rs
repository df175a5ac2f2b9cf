//! IPv6 helpers for DHCPv6 subnet management: pool derivation from a prefix,
//! address expansion and prefix overlap checks. Pure functions, no I/O.

pub mod pool;
pub mod prefix;

pub use pool::{expand_ipv6, pool_for_prefix, validate_prefix, PoolError, PoolRange};
pub use prefix::{parse_address, parse_prefix, prefixes_overlap};
