use anyhow::{anyhow, bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::command::Command;
use crate::protocol::version::ProtocolVersion;


/// Frames sent by the client carry a fixed header of seven u32 values (all big endian):
///
/// ```ascii
///  0: cmd
///  4: version code (see [ProtocolVersion])
///  8: client type
/// 12: message type
/// 16: app id
/// 20: length of the device id ('imei') in bytes
/// 24: length of the JSON body in bytes
/// 28: device id (UTF-8)
///  *: JSON body (UTF-8)
/// ```
pub const OUTBOUND_HEADER_LEN: usize = 7 * std::mem::size_of::<u32>();

/// Frames sent by the server have a compact header: the server does not echo client metadata
///  it already knows from the connection.
///
/// ```ascii
/// 0: cmd
/// 4: length of the JSON body in bytes
/// 8: JSON body (UTF-8)
/// ```
pub const INBOUND_HEADER_LEN: usize = 2 * std::mem::size_of::<u32>();

/// This is what the client sends as the body of frames without payload (e.g. heartbeats)
pub const EMPTY_BODY: &[u8] = b"{}";


/// A client-to-server frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub command: u32,
    pub version: ProtocolVersion,
    pub client_type: u32,
    pub message_type: u32,
    pub app_id: u32,
    pub device_id: String,
    /// `None` is sent as an empty JSON object
    pub body: Option<Value>,
}

impl OutboundFrame {
    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let body = match &self.body {
            Some(body) => serde_json::to_vec(body)?,
            None => EMPTY_BODY.to_vec(),
        };
        let device_id = self.device_id.as_bytes();

        let device_id_len: u32 = device_id.len().try_into()
            .map_err(|_| anyhow!("device id too long: {} bytes", device_id.len()))?;
        let body_len: u32 = body.len().try_into()
            .map_err(|_| anyhow!("body too long: {} bytes", body.len()))?;

        let mut buf = BytesMut::with_capacity(OUTBOUND_HEADER_LEN + device_id.len() + body.len());
        buf.put_u32(self.command);
        buf.put_u32(self.version.version_code());
        buf.put_u32(self.client_type);
        buf.put_u32(self.message_type);
        buf.put_u32(self.app_id);
        buf.put_u32(device_id_len);
        buf.put_u32(body_len);
        buf.put_slice(device_id);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// This is the server side's view of a client frame. The client itself never needs to
    ///  decode its own frames, but server simulations and tests do.
    pub fn try_decode(buf: &[u8]) -> anyhow::Result<OutboundFrame> {
        let mut buf = buf;

        let command = buf.try_get_u32()?;
        let version_code = buf.try_get_u32()?;
        let client_type = buf.try_get_u32()?;
        let message_type = buf.try_get_u32()?;
        let app_id = buf.try_get_u32()?;
        let device_id_len = buf.try_get_u32()? as usize;
        let body_len = buf.try_get_u32()? as usize;

        if device_id_len.checked_add(body_len) != Some(buf.len()) {
            bail!("declared lengths (device id {} + body {}) do not match the remaining {} bytes", device_id_len, body_len, buf.len());
        }

        let (device_id, body) = buf.split_at(device_id_len);
        let device_id = std::str::from_utf8(device_id)
            .context("device id is not valid UTF-8")?
            .to_string();

        let body = if body.is_empty() {
            None
        }
        else {
            Some(serde_json::from_slice(body).context("body is not valid JSON")?)
        };

        Ok(OutboundFrame {
            command,
            version: ProtocolVersion::new(version_code / 10_000, (version_code / 100) % 100, version_code % 100)?,
            client_type,
            message_type,
            app_id,
            device_id,
            body,
        })
    }

    pub fn known_command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let body = self.body.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(body)?)
    }
}

/// Encodes a client frame from its raw parts. The version string is validated before anything
///  is encoded, i.e. out-of-range version components fail before any I/O is attempted.
pub fn encode(
    command: Command,
    version: &str,
    client_type: u32,
    message_type: u32,
    app_id: u32,
    device_id: &str,
    body: Option<Value>,
) -> anyhow::Result<Bytes> {
    OutboundFrame {
        command: command.code(),
        version: version.parse()?,
        client_type,
        message_type,
        app_id,
        device_id: device_id.to_string(),
        body,
    }
        .encode()
}


/// A server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub command: u32,
    pub body: Value,
}

impl InboundFrame {
    pub fn new(command: Command, body: Value) -> InboundFrame {
        InboundFrame {
            command: command.code(),
            body,
        }
    }

    pub fn try_decode(buf: &[u8]) -> anyhow::Result<InboundFrame> {
        let mut buf = buf;

        let command = buf.try_get_u32()?;
        let body_len = buf.try_get_u32()? as usize;

        if body_len > buf.len() {
            bail!("declared body length {} exceeds the remaining {} bytes", body_len, buf.len());
        }
        if body_len < buf.len() {
            bail!("{} trailing bytes after a body of declared length {}", buf.len() - body_len, body_len);
        }

        let json = std::str::from_utf8(buf)
            .context("body is not valid UTF-8")?;
        let body = serde_json::from_str(json)
            .context("body is not valid JSON")?;

        Ok(InboundFrame {
            command,
            body,
        })
    }

    /// server side encoding, used by simulations and tests
    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let body = serde_json::to_vec(&self.body)?;
        let body_len: u32 = body.len().try_into()
            .map_err(|_| anyhow!("body too long: {} bytes", body.len()))?;

        let mut buf = BytesMut::with_capacity(INBOUND_HEADER_LEN + body.len());
        buf.put_u32(self.command);
        buf.put_u32(body_len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn known_command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}
