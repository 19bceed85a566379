//! Test doubles for the client's seams: an in-memory server connection, a recording connection,
//!  recording callbacks and a manual clock. They are used for testing the client itself, and
//!  they are exported for application testing.

pub mod callbacks;
pub mod clock;
pub mod connection;
