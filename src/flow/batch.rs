use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Buf;

use crate::error_handling::types::WireError;

/// `config_id: u32`, `calibration: u64`.
pub const HEADER_LEN: usize = 12;
/// Fixed part of a record, addresses excluded.
pub const RECORD_LEN: usize = 61;

const FLAG_V6: u8 = 0x01;
const FLAG_UDP: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Single-letter form stored in the `flows.proto` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "T",
            Protocol::Udp => "U",
        }
    }
}

/// Counters of one direction, with times in the probe's own milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Direction {
    pub packets: u32,
    pub bytes: u64,
    pub first: u64,
    pub last: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub protocol: Protocol,
    pub local_addr: IpAddr,
    pub remote_addr: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    /// Remote to local.
    pub inbound: Direction,
    /// Local to remote.
    pub outbound: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowBatch {
    pub config_id: u32,
    /// Probe time at which the batch was assembled.
    pub calibration: u64,
    pub records: Vec<FlowRecord>,
    /// Bytes at the end too short to hold another record.
    pub discarded: usize,
}

impl FlowBatch {
    /// Decodes the body of a `'D'` message (opcode already stripped).
    ///
    /// Records are laid out as
    /// `flags u8, in_packets u32, out_packets u32, in_bytes u64,
    /// out_bytes u64, local_port u16, remote_port u16, in_first u64,
    /// out_first u64, in_last u64, out_last u64`, all big endian, followed by
    /// the local and the remote address (16 bytes each with `FLAG_V6`,
    /// 4 otherwise).
    pub fn decode(data: &[u8]) -> Result<FlowBatch, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::ShortHeader(data.len()));
        }
        let mut buf = data;
        let config_id = buf.get_u32();
        let calibration = buf.get_u64();

        let mut records = Vec::with_capacity(buf.remaining() / RECORD_LEN);
        while buf.remaining() >= RECORD_LEN {
            records.push(read_record(&mut buf)?);
        }

        Ok(FlowBatch {
            config_id,
            calibration,
            records,
            discarded: buf.remaining(),
        })
    }
}

fn read_record(buf: &mut &[u8]) -> Result<FlowRecord, WireError> {
    let flags = buf.get_u8();
    let in_packets = buf.get_u32();
    let out_packets = buf.get_u32();
    let in_bytes = buf.get_u64();
    let out_bytes = buf.get_u64();
    let local_port = buf.get_u16();
    let remote_port = buf.get_u16();
    let in_first = buf.get_u64();
    let out_first = buf.get_u64();
    let in_last = buf.get_u64();
    let out_last = buf.get_u64();

    let v6 = flags & FLAG_V6 != 0;
    let local_addr = read_address(buf, v6)?;
    let remote_addr = read_address(buf, v6)?;

    Ok(FlowRecord {
        protocol: if flags & FLAG_UDP != 0 {
            Protocol::Udp
        } else {
            Protocol::Tcp
        },
        local_addr,
        remote_addr,
        local_port,
        remote_port,
        inbound: Direction {
            packets: in_packets,
            bytes: in_bytes,
            first: in_first,
            last: in_last,
        },
        outbound: Direction {
            packets: out_packets,
            bytes: out_bytes,
            first: out_first,
            last: out_last,
        },
    })
}

fn read_address(buf: &mut &[u8], v6: bool) -> Result<IpAddr, WireError> {
    let len = if v6 { 16 } else { 4 };
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(if v6 {
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        IpAddr::V4(Ipv4Addr::from(octets))
    })
}
