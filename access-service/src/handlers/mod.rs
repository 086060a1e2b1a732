//! HTTP handlers for the access service.

pub mod auth;
pub mod health;
pub mod members;
pub mod roles;
