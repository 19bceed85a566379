use std::fmt::{Display, Formatter};


/// Lifecycle of the connection to the IM server.
///
/// ```ascii
///  Init --init()--> Connecting --LOGIN_ACK--> Connected --error / close--> Disconnected
///                     ^   |                                                    |
///                     |   +-- failure: backoff, retry                          |
///                     +------------------ Reconnecting <-----------------------+
///
///  any state --destroy()--> Disconnecting (terminal)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// true while a connect loop is running
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        write!(f, "{}", s)
    }
}
