//! Address handling for fabric interfaces
//!
//! Provides:
//! - CIDR parsing for addresses (host bits kept) and subnets
//! - Parsing of `ip addr show` listings into bindings

use crate::error::{Error, Result};
use ipnet::IpNet;

/// Parse an interface address in CIDR form, e.g. `10.32.0.1/12`
///
/// Unlike a subnet, the host part is significant and is preserved.
pub fn parse_address(value: &str) -> Result<IpNet> {
    if !value.contains('/') {
        return Err(Error::InvalidCidr {
            value: value.to_string(),
            reason: "missing prefix length".to_string(),
        });
    }

    value.trim().parse::<IpNet>().map_err(|e| Error::InvalidCidr {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a subnet in CIDR form, normalised to its network address
pub fn parse_subnet(value: &str) -> Result<IpNet> {
    parse_address(value).map(|net| net.trunc())
}

/// Addresses listed by `ip addr show dev <dev>`
///
/// Only `inet`/`inet6` lines are considered; the token after the family
/// keyword is the address in CIDR form.
pub fn parse_bindings(listing: &str) -> Vec<IpNet> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("inet") | Some("inet6") => fields.next()?.parse::<IpNet>().ok(),
                _ => None,
            }
        })
        .collect()
}

/// Whether `address` is bound, comparing address and prefix exactly
pub fn is_bound(listing: &str, address: &IpNet) -> bool {
    parse_bindings(listing).iter().any(|bound| bound == address)
}
