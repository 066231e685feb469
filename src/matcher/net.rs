//! IP addresses and CIDR blocks for `ip` tests

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A single address (`10.0.0.1`) or a CIDR block (`10.0.0.0/8`, `fd00::/8`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ip range {input:?}: {reason}")]
pub struct IpRangeError {
    pub input: String,
    pub reason: &'static str,
}

/// Parse a client address; IPv4-mapped IPv6 addresses become IPv4
pub fn parse_client_ip(input: &str) -> Option<IpAddr> {
    let addr: IpAddr = input.trim().parse().ok()?;
    Some(normalize(addr))
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            IpAddr::V6((bits & m).into())
        }
    }
}

impl IpRange {
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = normalize(addr);
        if max_prefix(&addr) != max_prefix(&self.network) {
            return false;
        }
        mask(addr, self.prefix) == self.network
    }
}

impl FromStr for IpRange {
    type Err = IpRangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason| IpRangeError {
            input: input.to_string(),
            reason,
        };
        let trimmed = input.trim();
        let (addr, prefix) = match trimmed.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (trimmed, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| err("bad address"))?;
        let addr = normalize(addr);
        let max = max_prefix(&addr);
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| err("bad prefix length"))?,
            None => max,
        };
        if prefix > max {
            return Err(err("prefix length too large"));
        }
        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        parse_client_ip(s).unwrap()
    }

    #[test]
    fn test_single_address() {
        let range: IpRange = "192.168.1.10".parse().unwrap();
        assert!(range.contains(ip("192.168.1.10")));
        assert!(!range.contains(ip("192.168.1.11")));
    }

    #[test]
    fn test_cidr_v4() {
        let range: IpRange = "10.0.0.0/8".parse().unwrap();
        assert!(range.contains(ip("10.200.3.4")));
        assert!(!range.contains(ip("11.0.0.1")));
        assert!(range.contains(ip("::ffff:10.1.2.3")));

        let any: IpRange = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(ip("8.8.8.8")));
        assert!(!any.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_cidr_v6() {
        let range: IpRange = "2001:db8::/32".parse().unwrap();
        assert!(range.contains(ip("2001:db8:abcd::1")));
        assert!(!range.contains(ip("2001:db9::1")));
        // Host bits are masked off
        let loose: IpRange = "10.1.2.3/16".parse().unwrap();
        assert_eq!(loose.to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_invalid() {
        for bad in ["", "10.0.0", "10.0.0.0/33", "fe80::/129", "10.0.0.0/x", "host"] {
            assert!(bad.parse::<IpRange>().is_err(), "{:?} should fail", bad);
        }
        assert!(parse_client_ip("not-an-ip").is_none());
    }
}
