//! Transport core of an instant messaging client: the binary frame protocol, a self-healing
//!  connection to the IM server, reliable delivery of outgoing messages, calibrated message
//!  time stamps, and REST calls with single-flight renewal of access tokens.

pub mod auth;
pub mod client;
pub mod clock;
pub mod http;
pub mod protocol;
pub mod test_util;
pub mod transport;
