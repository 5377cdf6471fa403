//! Common code shared between `detect_server` and its clients.
pub mod protocol;
