use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error_handling::types::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetMode {
    Allow,
    Deny,
}

/// A compiled filter expression.
///
/// Children of `And`/`Or` and the members of the sets keep their textual
/// order, which the binary form preserves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    True,
    False,
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    IpSet { mode: SetMode, addresses: Vec<IpAddr> },
    PortSet { mode: SetMode, ports: Vec<u16> },
}

impl Filter {
    /// Single byte naming the node type, both in text and on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Filter::True => b'T',
            Filter::False => b'F',
            Filter::Not(_) => b'!',
            Filter::And(_) => b'&',
            Filter::Or(_) => b'|',
            Filter::IpSet { mode: SetMode::Deny, .. } => b'i',
            Filter::IpSet { mode: SetMode::Allow, .. } => b'I',
            Filter::PortSet { mode: SetMode::Deny, .. } => b'p',
            Filter::PortSet { mode: SetMode::Allow, .. } => b'P',
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// # Panics
    ///
    /// If a port set holds more than `u16::MAX` entries. The parser never
    /// builds one.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code());
        match self {
            Filter::True | Filter::False => {}
            Filter::Not(sub) => sub.encode_into(buf),
            Filter::And(subs) | Filter::Or(subs) => {
                buf.put_u32(subs.len() as u32);
                for sub in subs {
                    sub.encode_into(buf);
                }
            }
            Filter::IpSet { addresses, .. } => {
                buf.put_u32(addresses.len() as u32);
                for address in addresses {
                    put_address(buf, address);
                }
            }
            Filter::PortSet { ports, .. } => {
                let count = u16::try_from(ports.len())
                    .unwrap_or_else(|_| panic!("{} ports do not fit a port set", ports.len()));
                buf.put_u16(count);
                for port in ports {
                    buf.put_u16(*port);
                }
            }
        }
    }

    /// Decodes a complete binary filter; trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Filter, FilterError> {
        let mut buf = data;
        let filter = Self::read(&mut buf)?;
        if buf.has_remaining() {
            return Err(FilterError::TrailingBytes(buf.remaining()));
        }
        Ok(filter)
    }

    fn read(buf: &mut &[u8]) -> Result<Filter, FilterError> {
        need(buf, 1)?;
        let code = buf.get_u8();
        let filter = match code {
            b'T' => Filter::True,
            b'F' => Filter::False,
            b'!' => Filter::Not(Box::new(Self::read(buf)?)),
            b'&' | b'|' => {
                need(buf, 4)?;
                let count = buf.get_u32() as usize;
                let mut subs = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    subs.push(Self::read(buf)?);
                }
                if code == b'&' {
                    Filter::And(subs)
                } else {
                    Filter::Or(subs)
                }
            }
            b'i' | b'I' => {
                need(buf, 4)?;
                let count = buf.get_u32() as usize;
                let mut addresses = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    addresses.push(read_address(buf)?);
                }
                Filter::IpSet {
                    mode: mode_of(code),
                    addresses,
                }
            }
            b'p' | b'P' => {
                need(buf, 2)?;
                let count = buf.get_u16() as usize;
                need(buf, count * 2)?;
                let ports = (0..count).map(|_| buf.get_u16()).collect();
                Filter::PortSet {
                    mode: mode_of(code),
                    ports,
                }
            }
            other => return Err(FilterError::UnknownCode((other as char).to_string())),
        };
        Ok(filter)
    }
}

fn mode_of(code: u8) -> SetMode {
    if code.is_ascii_uppercase() {
        SetMode::Allow
    } else {
        SetMode::Deny
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), FilterError> {
    if buf.remaining() < len {
        Err(FilterError::Truncated)
    } else {
        Ok(())
    }
}

/// Family byte (`4` or `16`) followed by the address in network order.
pub fn put_address(buf: &mut BytesMut, address: &IpAddr) {
    match address {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
}

fn read_address(buf: &mut &[u8]) -> Result<IpAddr, FilterError> {
    need(buf, 1)?;
    match buf.get_u8() {
        4 => {
            need(buf, 4)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            need(buf, 16)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        family => Err(FilterError::UnknownFamily(family)),
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, code: u8, items: &[T]) -> fmt::Result {
    write!(f, "{}(", code as char)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(")")
}

/// Renders the expression in the textual filter language.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::True | Filter::False => write!(f, "{}", self.code() as char),
            Filter::Not(sub) => write!(f, "!({sub})"),
            Filter::And(subs) | Filter::Or(subs) => write_list(f, self.code(), subs),
            Filter::IpSet { addresses, .. } => write_list(f, self.code(), addresses),
            Filter::PortSet { ports, .. } => write_list(f, self.code(), ports),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        super::parser::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_scenario_encoding() {
        let filter = Filter::And(vec![
            Filter::IpSet {
                mode: SetMode::Deny,
                addresses: vec![ip("10.0.0.1")],
            },
            Filter::PortSet {
                mode: SetMode::Deny,
                ports: vec![80, 443],
            },
        ]);
        let expected: &[u8] = &[
            b'&', 0, 0, 0, 2, // and, two children
            b'i', 0, 0, 0, 1, 4, 10, 0, 0, 1, // one IPv4 address
            b'p', 0, 2, 0, 80, 1, 187, // two ports
        ];
        assert_eq!(filter.encode().as_ref(), expected);
    }

    #[test]
    fn test_not_has_no_count() {
        let filter = Filter::Not(Box::new(Filter::True));
        assert_eq!(filter.encode().as_ref(), b"!T");
    }

    #[test]
    fn test_ipv6_and_allow_codes() {
        let filter = Filter::Or(vec![
            Filter::IpSet {
                mode: SetMode::Allow,
                addresses: vec![ip("::1")],
            },
            Filter::PortSet {
                mode: SetMode::Allow,
                ports: vec![],
            },
        ]);
        let bytes = filter.encode();
        assert_eq!(bytes[0], b'|');
        assert_eq!(bytes[5], b'I');
        assert_eq!(bytes[10], 16);
        assert_eq!(bytes[11 + 15], 1);
        assert_eq!(&bytes[27..], &[b'P', 0, 0]);
        assert_eq!(Filter::decode(&bytes).unwrap(), filter);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let filter = Filter::Not(Box::new(Filter::Or(vec![
            Filter::False,
            Filter::PortSet {
                mode: SetMode::Deny,
                ports: vec![22],
            },
        ])));
        assert_eq!(filter.encode(), filter.clone().encode());
        let bytes = filter.encode();
        assert_eq!(Filter::decode(&bytes).unwrap().encode(), bytes);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = Filter::IpSet {
            mode: SetMode::Deny,
            addresses: vec![ip("192.168.1.1")],
        }
        .encode();
        for cut in 0..bytes.len() {
            assert_eq!(
                Filter::decode(&bytes[..cut]),
                Err(FilterError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            Filter::decode(b"i\0\0\0\x01\x05abcde"),
            Err(FilterError::UnknownFamily(5))
        );
        assert_eq!(Filter::decode(b"TT"), Err(FilterError::TrailingBytes(1)));
        assert_eq!(
            Filter::decode(b"x"),
            Err(FilterError::UnknownCode("x".into()))
        );
    }

    #[test]
    fn test_huge_declared_count_does_not_allocate() {
        assert_eq!(
            Filter::decode(b"&\xff\xff\xff\xff"),
            Err(FilterError::Truncated)
        );
    }

    #[test]
    fn test_display() {
        let filter = Filter::And(vec![
            Filter::Not(Box::new(Filter::True)),
            Filter::IpSet {
                mode: SetMode::Allow,
                addresses: vec![ip("10.0.0.1"), ip("2001:db8::1")],
            },
            Filter::Or(vec![]),
        ]);
        assert_eq!(filter.to_string(), "&(!(T),I(10.0.0.1,2001:db8::1),|())");
    }
}
