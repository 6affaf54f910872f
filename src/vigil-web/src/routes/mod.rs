//! HTTP route handlers

pub mod api;
pub mod receiver;

pub use api::*;
pub use receiver::*;
