//! The IM server's REST API, with transparent renewal of expired access tokens.

pub mod dto;
pub mod http_api;
