//! Backend for a local feed of posts and comments with signed votes.

pub mod auth;
pub mod config;
pub mod error;
pub mod geo;
pub mod models;
pub mod pagination;
pub mod routes;
pub mod store;
