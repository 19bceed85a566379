//! The binary IM protocol: command space, frame layouts and JSON bodies.
//!
//! Frames are asymmetric. Client frames declare protocol version, client type, app id and
//!  device id in every header, server frames carry only the command and the body length.

pub mod bodies;
pub mod command;
pub mod frame;
pub mod version;
