//! Payloads exchanged with probes, opcode byte included.
//!
//! Inbound:
//! - `'C'`: config request, no body.
//! - `'D'`: flow batch, see [`FlowBatch`](super::batch::FlowBatch).
//! - `'U'`: diff request, `full u8, name_len u32, name, epoch u32,
//!   [from u32 unless full], to u32`.
//!
//! Outbound:
//! - `'C'`: `version, max_flows, timeout, minpackets` then the binary filter.
//! - `'U'`: filter version announcement, `name_len u32, name, epoch u32,
//!   version u32`.
//! - `'D'`: diff, `name_len u32, name, full u8, epoch u32, [from u32], to u32`
//!   followed by the entries.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, warn};

use super::diff::DiffKey;
use super::store::ConfigSnapshot;
use crate::error_handling::types::WireError;
use crate::filter::{expression::put_address, parse};

/// Config keys sent as numbers, in wire order.
pub const NUMERIC_KEYS: [&str; 4] = ["version", "max_flows", "timeout", "minpackets"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Config,
    Flows(Bytes),
    Diff(DiffKey),
}

fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated {
            needed: len - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

impl Request {
    pub fn parse(mut payload: Bytes) -> Result<Request, WireError> {
        if payload.is_empty() {
            return Err(WireError::Empty);
        }
        match payload.get_u8() {
            b'C' => Ok(Request::Config),
            b'D' => Ok(Request::Flows(payload)),
            b'U' => {
                need(&payload, 5)?;
                let full = payload.get_u8() != 0;
                let name_len = payload.get_u32() as usize;
                need(&payload, name_len)?;
                let name = String::from_utf8(payload.split_to(name_len).to_vec())
                    .map_err(|_| WireError::BadName)?;
                let key = if full {
                    need(&payload, 8)?;
                    let epoch = payload.get_u32();
                    DiffKey::full(name, epoch, payload.get_u32())
                } else {
                    need(&payload, 12)?;
                    let epoch = payload.get_u32();
                    let from = payload.get_u32();
                    DiffKey::incremental(name, epoch, from, payload.get_u32())
                };
                Ok(Request::Diff(key))
            }
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

fn numeric(config: &ConfigSnapshot, key: &str) -> Result<u32, WireError> {
    let value = config.get(key);
    value
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| WireError::BadConfigValue {
            key: key.to_string(),
            value: value.cloned(),
        })
}

/// The config version the probes are expected to report in flow batches.
pub fn config_version(config: &ConfigSnapshot) -> Option<u32> {
    numeric(config, "version").ok()
}

/// Builds a `'C'` message using the filter stored under `filter_key`. A
/// missing or empty filter is sent as an empty one.
pub fn build_config(config: &ConfigSnapshot, filter_key: &str) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(1 + 16);
    buf.put_u8(b'C');
    for key in NUMERIC_KEYS {
        buf.put_u32(numeric(config, key)?);
    }
    if let Some(text) = config.get(filter_key).filter(|text| !text.trim().is_empty()) {
        let filter = parse(text)?;
        debug!("Filter: {filter}");
        filter.encode_into(&mut buf);
    }
    Ok(buf.freeze())
}

pub fn build_announcement(name: &str, epoch: u32, version: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 12 + name.len());
    buf.put_u8(b'U');
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u32(epoch);
    buf.put_u32(version);
    buf.freeze()
}

/// Parses a stored filter address: `ip`, `ip:port` or `[ipv6]:port`.
pub fn parse_address(text: &str) -> Option<(IpAddr, Option<u16>)> {
    let text = text.trim();
    if let Ok(ip) = text.parse::<IpAddr>() {
        return Some((ip, None));
    }
    text.parse::<SocketAddr>()
        .ok()
        .map(|addr| (addr.ip(), Some(addr.port())))
}

/// Builds a `'D'` message from the entries of a diff.
///
/// Entry tags are 4 (IPv4), 16 (IPv6), 6 (IPv4 and port) or 18 (IPv6 and
/// port), plus one for additions. Addresses that cannot be parsed are
/// skipped.
pub fn build_diff(key: &DiffKey, entries: &BTreeMap<String, bool>) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 17 + key.name.len() + entries.len() * 19);
    buf.put_u8(b'D');
    buf.put_u32(key.name.len() as u32);
    buf.put_slice(key.name.as_bytes());
    buf.put_u8(u8::from(key.full));
    buf.put_u32(key.epoch);
    if !key.full {
        buf.put_u32(key.from);
    }
    buf.put_u32(key.to);

    for (address, added) in entries {
        let Some((ip, port)) = parse_address(address) else {
            warn!("Skipping unparsable address {address:?} in filter {}", key.name);
            continue;
        };
        let mut entry = BytesMut::with_capacity(17);
        put_address(&mut entry, &ip);
        let family = entry[0];
        let tag = match port {
            Some(_) => family + 2,
            None => family,
        } + u8::from(*added);
        entry[0] = tag;
        buf.put(entry);
        if let Some(port) = port {
            buf.put_u16(port);
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ConfigSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_config() -> ConfigSnapshot {
        config(&[
            ("version", "7"),
            ("max_flows", "1000"),
            ("timeout", "30000"),
            ("minpackets", "2"),
            ("filter", "&(i(10.0.0.1),p(80,443))"),
            ("filter-diff", "T"),
        ])
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            Request::parse(Bytes::from_static(b"C")).unwrap(),
            Request::Config
        );
        assert_eq!(
            Request::parse(Bytes::from_static(b"Dabc")).unwrap(),
            Request::Flows(Bytes::from_static(b"abc"))
        );
        assert_eq!(Request::parse(Bytes::new()), Err(WireError::Empty));
        assert_eq!(
            Request::parse(Bytes::from_static(b"Z")),
            Err(WireError::UnknownOpcode(b'Z'))
        );
    }

    #[test]
    fn test_parse_diff_requests() {
        let full = Bytes::from_static(b"U\x01\x00\x00\x00\x01f\x00\x00\x00\x02\x00\x00\x00\x05");
        assert_eq!(
            Request::parse(full).unwrap(),
            Request::Diff(DiffKey::full("f", 2, 5))
        );

        let incremental = Bytes::from_static(
            b"U\x00\x00\x00\x00\x02ab\x00\x00\x00\x01\x00\x00\x00\x03\x00\x00\x00\x09",
        );
        assert_eq!(
            Request::parse(incremental).unwrap(),
            Request::Diff(DiffKey::incremental("ab", 1, 3, 9))
        );

        let short = Bytes::from_static(b"U\x00\x00\x00\x00\x02ab\x00\x00\x00\x01");
        assert_eq!(
            Request::parse(short),
            Err(WireError::Truncated { needed: 8 })
        );
        let long_name = Bytes::from_static(b"U\x01\x00\x00\x01\x00f");
        assert_eq!(
            Request::parse(long_name),
            Err(WireError::Truncated { needed: 255 })
        );
    }

    #[test]
    fn test_build_config() {
        let payload = build_config(&base_config(), "filter").unwrap();
        assert_eq!(&payload[..1], b"C");
        assert_eq!(&payload[1..5], &7u32.to_be_bytes());
        assert_eq!(&payload[5..9], &1000u32.to_be_bytes());
        assert_eq!(&payload[13..17], &2u32.to_be_bytes());
        assert_eq!(&payload[17..22], b"&\x00\x00\x00\x02");

        let diff_payload = build_config(&base_config(), "filter-diff").unwrap();
        assert_eq!(&diff_payload[17..], b"T");
    }

    #[test]
    fn test_build_config_without_filter() {
        let mut cfg = base_config();
        cfg.insert("filter".into(), "  ".into());
        cfg.remove("filter-diff");
        assert_eq!(build_config(&cfg, "filter").unwrap().len(), 17);
        assert_eq!(build_config(&cfg, "filter-diff").unwrap().len(), 17);
    }

    #[test]
    fn test_build_config_rejects_bad_values() {
        let mut cfg = base_config();
        cfg.insert("timeout".into(), "soon".into());
        assert_eq!(
            build_config(&cfg, "filter"),
            Err(WireError::BadConfigValue {
                key: "timeout".into(),
                value: Some("soon".into())
            })
        );

        let mut cfg = base_config();
        cfg.insert("filter".into(), "q".into());
        assert!(matches!(
            build_config(&cfg, "filter"),
            Err(WireError::Filter(_))
        ));
        assert_eq!(config_version(&cfg), Some(7));
    }

    #[test]
    fn test_build_announcement() {
        assert_eq!(
            build_announcement("f", 2, 9).as_ref(),
            b"U\x00\x00\x00\x01f\x00\x00\x00\x02\x00\x00\x00\x09"
        );
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(
            parse_address("10.0.0.1"),
            Some(("10.0.0.1".parse().unwrap(), None))
        );
        assert_eq!(
            parse_address("2001:db8::1"),
            Some(("2001:db8::1".parse().unwrap(), None))
        );
        assert_eq!(
            parse_address("10.0.0.1:8080"),
            Some(("10.0.0.1".parse().unwrap(), Some(8080)))
        );
        assert_eq!(
            parse_address("[2001:db8::1]:53"),
            Some(("2001:db8::1".parse().unwrap(), Some(53)))
        );
        assert_eq!(parse_address("example.org"), None);
    }

    #[test]
    fn test_build_diff() {
        let entries = BTreeMap::from([
            ("10.0.0.1".to_string(), true),
            ("10.0.0.2:80".to_string(), false),
            ("[::1]:53".to_string(), true),
            ("bogus".to_string(), true),
        ]);
        let payload = build_diff(&DiffKey::incremental("f", 1, 2, 3), &entries);

        let mut expected = BytesMut::new();
        expected.put_slice(b"D\x00\x00\x00\x01f\x00");
        expected.put_slice(&[0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);
        expected.put_slice(&[5, 10, 0, 0, 1]);
        expected.put_slice(&[6, 10, 0, 0, 2, 0, 80]);
        expected.put_u8(19);
        expected.put_slice(&"::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        expected.put_u16(53);
        assert_eq!(payload, expected.freeze());
    }

    #[test]
    fn test_build_full_diff_has_no_from() {
        let entries = BTreeMap::from([("10.0.0.9".to_string(), true)]);
        let payload = build_diff(&DiffKey::full("f", 1, 5), &entries);
        assert_eq!(
            payload.as_ref(),
            b"D\x00\x00\x00\x01f\x01\x00\x00\x00\x01\x00\x00\x00\x05\x05\x0a\x00\x00\x09"
        );
    }
}
