pub mod auth;
pub mod cors;
pub mod method_guard;
pub mod request_id;
