//! Terminal client for the hyperlocal feed.

pub mod api;
pub mod cache;
pub mod config;
