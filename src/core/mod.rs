// src/core/mod.rs
pub mod accounts;
pub mod bot;
pub mod engine;
pub mod multiplexer;
pub mod orders;
pub mod subscriptions;
pub mod supervisor;
