use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error_handling::types::WireError;

/// A connected probe as the rest of the system sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    pub id: Uuid,
    pub name: String,
    pub protocol_version: u32,
}

impl ClientHandle {
    pub fn new(name: impl Into<String>, protocol_version: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            protocol_version,
        }
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn read_name(buf: &mut Bytes) -> Result<String, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            needed: 4 - buf.remaining(),
        });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| WireError::BadName)
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
}

/// First frame of a connection: `name_len u32, name, protocol_version u32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub name: String,
    pub protocol_version: u32,
}

impl Hello {
    pub fn decode(mut frame: Bytes) -> Result<Hello, WireError> {
        let name = read_name(&mut frame)?;
        if frame.remaining() < 4 {
            return Err(WireError::Truncated {
                needed: 4 - frame.remaining(),
            });
        }
        let protocol_version = frame.get_u32();
        Ok(Hello {
            name,
            protocol_version,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.name.len());
        put_name(&mut buf, &self.name);
        buf.put_u32(self.protocol_version);
        buf.freeze()
    }
}

/// Any later frame: `plugin_name_len u32, plugin_name, payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFrame {
    pub plugin: String,
    pub payload: Bytes,
}

impl PluginFrame {
    pub fn decode(mut frame: Bytes) -> Result<PluginFrame, WireError> {
        let plugin = read_name(&mut frame)?;
        Ok(PluginFrame {
            plugin,
            payload: frame,
        })
    }

    pub fn encode(plugin: &str, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + plugin.len() + payload.len());
        put_name(&mut buf, plugin);
        buf.put_slice(payload);
        buf.freeze()
    }
}
