//! Credentials for the REST API: storage collaborators and the coordinator that renews
//!  expired access tokens.

pub mod storage;
pub mod token_coordinator;
