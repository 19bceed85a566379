//! The IM client: connection lifecycle, reliable message delivery, and the dispatch of
//!  everything the server sends.

pub mod callbacks;
pub mod client_config;
pub mod client_event;
pub mod connection;
pub mod connection_state;
pub mod delivery;
pub mod dispatcher;
pub mod im_client;
pub mod session;
