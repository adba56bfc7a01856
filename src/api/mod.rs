//! HTTP surface: the client-facing proxy listener and the admin listener.

pub mod admin;
pub mod health;
pub mod proxy;
pub mod request_id;
