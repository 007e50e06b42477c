//! IPv4 address and subnet value types
//!
//! Both types are plain values: parsing is the only fallible operation and
//! nothing here touches the network.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed IPv4 address: {0}")]
    MalformedAddress(String),
    #[error("Malformed IPv4 subnet: {0}")]
    MalformedSubnet(String),
    #[error("Offset {offset} is outside subnet {subnet}")]
    OffsetOutOfRange { subnet: String, offset: i64 },
}

/// A 32-bit IPv4 address, ordered and hashed by its raw value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Address(u32);

impl Ipv4Address {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl FromStr for Ipv4Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressError::MalformedAddress(s.to_string());
        let mut raw: u32 = 0;
        let mut fields = 0;
        for field in s.split('.') {
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let octet: u8 = field.parse().map_err(|_| malformed())?;
            raw = (raw << 8) | u32::from(octet);
            fields += 1;
        }
        if fields != 4 {
            return Err(malformed());
        }
        Ok(Self(raw))
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(addr: Ipv4Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

/// A CIDR subnet whose base address is always stored pre-masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Subnet {
    base: Ipv4Address,
    prefix: u8,
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

impl Ipv4Subnet {
    /// Build a subnet, masking `base` down to `prefix` bits.
    pub fn new(base: Ipv4Address, prefix: u8) -> Result<Self, AddressError> {
        if prefix > 32 {
            return Err(AddressError::MalformedSubnet(format!("{}/{}", base, prefix)));
        }
        Ok(Self {
            base: Ipv4Address(base.raw() & mask(prefix)),
            prefix,
        })
    }

    /// A /32 subnet holding a single host
    pub fn host(addr: Ipv4Address) -> Self {
        Self {
            base: addr,
            prefix: 32,
        }
    }

    pub fn network(&self) -> Ipv4Address {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn broadcast(&self) -> Ipv4Address {
        Ipv4Address(self.base.raw() | !mask(self.prefix))
    }

    /// Number of addresses covered, including network and broadcast
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn contains_address(&self, addr: Ipv4Address) -> bool {
        addr.raw() & mask(self.prefix) == self.base.raw()
    }

    /// True when `other` is the same network or a more specific part of it.
    pub fn contains_subnet(&self, other: &Ipv4Subnet) -> bool {
        other.prefix >= self.prefix && other.base.raw() & mask(self.prefix) == self.base.raw()
    }

    /// Address at `offset` from the network address; negative offsets count
    /// back from the broadcast address (-1 is the broadcast address itself).
    pub fn address_at(&self, offset: i64) -> Result<Ipv4Address, AddressError> {
        let size = self.size() as i64;
        let index = if offset >= 0 { offset } else { size + offset };
        if !(0..size).contains(&index) {
            return Err(AddressError::OffsetOutOfRange {
                subnet: self.to_string(),
                offset,
            });
        }
        Ok(Ipv4Address(self.base.raw() + index as u32))
    }
}

impl FromStr for Ipv4Subnet {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressError::MalformedSubnet(s.to_string());
        let (base, prefix) = match s.split_once('/') {
            Some((base, prefix)) => {
                if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                (base, prefix.parse::<u8>().map_err(|_| malformed())?)
            }
            None => (s, 32),
        };
        let base: Ipv4Address = base.parse().map_err(|_| malformed())?;
        Self::new(base, prefix).map_err(|_| malformed())
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Ipv4Address {
        s.parse().unwrap()
    }

    fn subnet(s: &str) -> Ipv4Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn test_address_round_trip() {
        for text in ["0.0.0.0", "10.1.2.3", "172.17.0.2", "255.255.255.255"] {
            assert_eq!(addr(text).to_string(), text);
        }
    }

    #[test]
    fn test_address_rejects_malformed() {
        for text in ["", "10.1.2", "10.1.2.3.4", "10.1.2.256", "a.b.c.d", "10..2.3", "-1.0.0.0"] {
            assert!(
                matches!(text.parse::<Ipv4Address>(), Err(AddressError::MalformedAddress(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_address_ordering_by_raw_value() {
        assert!(addr("10.0.0.2") < addr("10.0.0.10"));
        assert!(addr("9.255.255.255") < addr("10.0.0.0"));
        assert_eq!(addr("10.0.0.1").raw(), 0x0A00_0001);
    }

    #[test]
    fn test_std_conversion() {
        let std_addr = Ipv4Addr::new(192, 168, 1, 7);
        let ours = Ipv4Address::from(std_addr);
        assert_eq!(ours.to_string(), "192.168.1.7");
        assert_eq!(Ipv4Addr::from(ours), std_addr);
    }

    #[test]
    fn test_subnet_is_premasked() {
        assert_eq!(subnet("10.1.2.3/16"), subnet("10.1.0.0/16"));
        assert_eq!(subnet("10.1.2.3/16").to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_subnet_defaults_to_host() {
        let s = subnet("10.1.2.3");
        assert_eq!(s.prefix(), 32);
        assert_eq!(s, Ipv4Subnet::host(addr("10.1.2.3")));
    }

    #[test]
    fn test_subnet_rejects_malformed() {
        for text in ["10.0.0.0/33", "10.0.0.0/", "10.0.0/8", "10.0.0.0/x", "/8"] {
            assert!(
                matches!(text.parse::<Ipv4Subnet>(), Err(AddressError::MalformedSubnet(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_contains_address() {
        let s = subnet("10.1.2.0/24");
        assert!(s.contains_address(addr("10.1.2.0")));
        assert!(s.contains_address(addr("10.1.2.77")));
        assert!(s.contains_address(addr("10.1.2.255")));
        assert!(!s.contains_address(addr("10.1.3.0")));
        assert!(subnet("0.0.0.0/0").contains_address(addr("8.8.8.8")));
    }

    #[test]
    fn test_contains_subnet() {
        let broad = subnet("10.1.0.0/16");
        let narrow = subnet("10.1.2.0/24");
        assert!(broad.contains_subnet(&narrow));
        assert!(!narrow.contains_subnet(&broad));
        assert!(broad.contains_subnet(&broad));
        assert!(!broad.contains_subnet(&subnet("10.2.0.0/16")));
    }

    #[test]
    fn test_address_at() {
        let s = subnet("192.168.4.0/22");
        assert_eq!(s.address_at(0).unwrap(), s.network());
        assert_eq!(s.address_at(-1).unwrap(), s.broadcast());
        assert_eq!(s.address_at(1).unwrap(), addr("192.168.4.1"));
        assert_eq!(s.address_at(-2).unwrap(), addr("192.168.7.254"));
        assert_eq!(s.broadcast(), addr("192.168.7.255"));
    }

    #[test]
    fn test_address_at_out_of_range() {
        let s = subnet("10.0.0.0/30");
        assert!(s.address_at(3).is_ok());
        assert!(s.address_at(4).is_err());
        assert!(s.address_at(-4).is_ok());
        assert!(s.address_at(-5).is_err());

        let top = subnet("255.255.255.255/32");
        assert!(top.address_at(1).is_err());
    }

    #[test]
    fn test_broadcast_plus_one_not_contained() {
        for text in ["10.1.2.0/24", "172.16.0.0/12", "10.0.0.8/29"] {
            let s = subnet(text);
            let past = Ipv4Address::from_raw(s.broadcast().raw() + 1);
            assert!(s.contains_address(s.broadcast()));
            assert!(!s.contains_address(past));
        }
    }

    #[test]
    fn test_zero_prefix() {
        let all = subnet("1.2.3.4/0");
        assert_eq!(all.network(), addr("0.0.0.0"));
        assert_eq!(all.broadcast(), addr("255.255.255.255"));
        assert_eq!(all.size(), 1 << 32);
    }
}
