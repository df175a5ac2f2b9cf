use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix of the first leasable address; `::1` stays with the BVI gateway.
const POOL_START_SUFFIX: &str = "2";
/// Suffix of the last leasable address; `::ffff` is kept out of the pool.
const POOL_END_SUFFIX: &str = "fffe";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Invalid IPv6 prefix: {0}")]
    InvalidPrefix(String),

    #[error("Invalid IPv6 address: {0}")]
    InvalidAddress(String),
}

/// Usable address range of a subnet pool.
///
/// Kept structured internally; the Kea `"start - end"` form only exists at the
/// wire boundary (`to_kea_pool` / `parse_kea_pool`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRange {
    pub start: Ipv6Addr,
    pub end: Ipv6Addr,
}

impl PoolRange {
    pub fn to_kea_pool(&self) -> String {
        format!("{} - {}", self.start, self.end)
    }

    /// Parse Kea's `"start - end"` pool notation (whitespace around `-` optional).
    pub fn parse_kea_pool(pool: &str) -> Result<Self, PoolError> {
        let (start, end) = pool
            .split_once('-')
            .ok_or_else(|| PoolError::InvalidAddress(pool.to_string()))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| PoolError::InvalidAddress(start.trim().to_string()))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| PoolError::InvalidAddress(end.trim().to_string()))?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for PoolRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_kea_pool())
    }
}

/// Derive the `::2` to `::fffe` pool of a CIDR prefix such as `2001:db8:1::/64`.
///
/// The last 16-bit group of the given address is replaced, so the result
/// stays inside the prefix for any length up to /112.
pub fn pool_for_prefix(prefix: &str) -> Result<PoolRange, PoolError> {
    validate_prefix(prefix)?;

    let prefix = prefix.trim().to_ascii_lowercase();
    let (network, _) = prefix
        .split_once('/')
        .ok_or_else(|| PoolError::InvalidPrefix(prefix.clone()))?;
    let full = expand_ipv6(network)?;

    // Everything up to and including the last ':' of the expanded form
    let base = match full.rfind(':') {
        Some(idx) => &full[..=idx],
        None => return Err(PoolError::InvalidPrefix(prefix.clone())),
    };

    let start = format!("{base}{POOL_START_SUFFIX}");
    let end = format!("{base}{POOL_END_SUFFIX}");

    Ok(PoolRange {
        start: start.parse().map_err(|_| PoolError::InvalidAddress(start.clone()))?,
        end: end.parse().map_err(|_| PoolError::InvalidAddress(end.clone()))?,
    })
}

/// Check `^[0-9a-fA-F:]+/\d{1,3}$`, a length in `1..=128` and an expandable address.
pub fn validate_prefix(prefix: &str) -> Result<(), PoolError> {
    let prefix = prefix.trim();
    let invalid = || PoolError::InvalidPrefix(prefix.to_string());

    let (address, length) = prefix.split_once('/').ok_or_else(invalid)?;

    if address.is_empty() || !address.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
        return Err(invalid());
    }
    if length.is_empty() || length.len() > 3 || !length.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let length: u16 = length.parse().map_err(|_| invalid())?;
    if !(1..=128).contains(&length) {
        return Err(invalid());
    }

    expand_ipv6(address).map_err(|_| invalid())?;
    Ok(())
}

/// Expand an abbreviated IPv6 address to eight zero-padded groups,
/// e.g. `2001:db8::1` to `2001:0db8:0000:0000:0000:0000:0000:0001`.
pub fn expand_ipv6(address: &str) -> Result<String, PoolError> {
    let address = address.trim().to_ascii_lowercase();
    let invalid = || PoolError::InvalidAddress(address.clone());

    let groups: Vec<String> = match address.split_once("::") {
        Some((left, right)) => {
            if right.contains("::") {
                return Err(invalid());
            }
            let left: Vec<&str> = left.split(':').collect();
            let right: Vec<&str> = right.split(':').collect();
            let missing = 8usize
                .checked_sub(left.len() + right.len())
                .ok_or_else(invalid)?;

            left.into_iter()
                .map(pad_group)
                .chain(std::iter::repeat_n("0000".to_string(), missing))
                .chain(right.into_iter().map(pad_group))
                .collect()
        }
        None => address.split(':').map(pad_group).collect(),
    };

    if groups.len() != 8 || groups.iter().any(|g| g.len() != 4) {
        return Err(invalid());
    }

    let expanded = groups.join(":");

    // Both spellings must be a real address: catches non-hex groups and ":::"
    expanded.parse::<Ipv6Addr>().map_err(|_| invalid())?;
    address.parse::<Ipv6Addr>().map_err(|_| invalid())?;

    Ok(expanded)
}

fn pad_group(group: &str) -> String {
    format!("{group:0>4}")
}
