//! HTTP and WebSocket front end for the chat core, backed by SQLite.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod store;
pub mod ws;
