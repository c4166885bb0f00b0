//! Confab server: WebSocket chat rooms backed by a live conversation buffer,
//! one-at-a-time generation per chat and a durable chat store.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod app_state;
mod db;
mod handlers;
mod http;
mod middleware;
mod routes;
pub mod server;
pub mod services;
mod tracer;
