//! IP address and CIDR matching.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ArbiterError, Result};

/// Parse a single IPv4 or IPv6 address literal.
pub fn parse_ip(input: &str) -> Result<IpAddr> {
    input
        .parse::<IpAddr>()
        .map_err(|_| ArbiterError::InvalidAddress(format!("{:?} is not an IP address", input)))
}

/// A single address or a CIDR range, parsed once and reused for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpTarget {
    Addr(IpAddr),
    Net(IpNet),
}

impl IpTarget {
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains('/') {
            input
                .parse::<IpNet>()
                .map(IpTarget::Net)
                .map_err(|_| ArbiterError::InvalidAddress(format!("{:?} is not a CIDR range", input)))
        } else {
            parse_ip(input).map(IpTarget::Addr)
        }
    }

    /// Whether `ip` is this address or falls within this range. Addresses of
    /// a different family never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            IpTarget::Addr(addr) => addr == ip,
            IpTarget::Net(net) => net.contains(ip),
        }
    }
}

impl FromStr for IpTarget {
    type Err = ArbiterError;

    fn from_str(s: &str) -> Result<Self> {
        IpTarget::parse(s)
    }
}

impl TryFrom<String> for IpTarget {
    type Error = ArbiterError;

    fn try_from(value: String) -> Result<Self> {
        IpTarget::parse(&value)
    }
}

impl From<IpTarget> for String {
    fn from(target: IpTarget) -> Self {
        target.to_string()
    }
}

impl std::fmt::Display for IpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpTarget::Addr(addr) => write!(f, "{}", addr),
            IpTarget::Net(net) => write!(f, "{}", net),
        }
    }
}

/// A list of addresses and ranges; matches when any member does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpList(Vec<IpTarget>);

impl IpList {
    pub fn new(targets: Vec<IpTarget>) -> Self {
        Self(targets)
    }

    pub fn parse<'a, I>(inputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        inputs
            .into_iter()
            .map(IpTarget::parse)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.iter().any(|target| target.contains(ip))
    }

    /// The first member matching `ip`, if any.
    pub fn find(&self, ip: &IpAddr) -> Option<&IpTarget> {
        self.0.iter().find(|target| target.contains(ip))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpTarget> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Test an address literal against an address or CIDR literal.
pub fn matches(ip: &str, target: &str) -> Result<bool> {
    let ip = parse_ip(ip)?;
    Ok(IpTarget::parse(target)?.contains(&ip))
}

/// Test an address literal against a list of address or CIDR literals.
pub fn matches_any(ip: &str, targets: &[&str]) -> Result<bool> {
    let ip = parse_ip(ip)?;
    Ok(IpList::parse(targets.iter().copied())?.contains(&ip))
}
