use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::client::client_config::ClientConfig;
use crate::protocol::bodies::LoginBody;
use crate::protocol::command::{Command, MessageType};
use crate::protocol::frame::OutboundFrame;
use crate::protocol::version::ProtocolVersion;


/// What the application provides when it brings a client online.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub ws_url: String,
    pub http_url: String,
    pub user_id: String,
    pub token: String,
    pub app_id: u32,
    /// opaque per-installation id, sent as 'imei' in every frame header
    pub device_id: String,
}

/// The identity of a logged-in client, and the header fields that go with it.
#[derive(Debug, Clone)]
pub struct ClientSession {
    params: SessionParams,
    version: ProtocolVersion,
    client_type: u32,
}

impl ClientSession {
    pub fn new(params: SessionParams, config: &ClientConfig) -> anyhow::Result<ClientSession> {
        Ok(ClientSession {
            params,
            version: config.protocol_version.parse()?,
            client_type: config.client_type,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.params.user_id
    }

    pub fn ws_url(&self) -> &str {
        &self.params.ws_url
    }

    pub fn http_url(&self) -> &str {
        &self.params.http_url
    }

    pub fn app_id(&self) -> u32 {
        self.params.app_id
    }

    pub fn device_id(&self) -> &str {
        &self.params.device_id
    }

    pub fn client_type(&self) -> u32 {
        self.client_type
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// NB: all frames the client sends carry message type 'text' in the header, the actual
    ///  content type of a chat message is part of its body
    pub fn frame(&self, command: Command, body: Option<Value>) -> anyhow::Result<Bytes> {
        OutboundFrame {
            command: command.code(),
            version: self.version,
            client_type: self.client_type,
            message_type: MessageType::Text.code(),
            app_id: self.params.app_id,
            device_id: self.params.device_id.clone(),
            body,
        }
            .encode()
    }

    pub fn frame_with<T: Serialize>(&self, command: Command, body: &T) -> anyhow::Result<Bytes> {
        self.frame(command, Some(serde_json::to_value(body)?))
    }

    pub fn login_frame(&self) -> anyhow::Result<Bytes> {
        self.frame_with(Command::Login, &LoginBody {
            user_id: self.params.user_id.clone(),
            token: self.params.token.clone(),
        })
    }

    pub fn heartbeat_frame(&self) -> anyhow::Result<Bytes> {
        self.frame(Command::HeartBeat, None)
    }
}
