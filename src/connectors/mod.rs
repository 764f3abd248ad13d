// src/connectors/mod.rs
pub mod messages;
pub mod paper;
pub mod tinkoff;
pub mod traits;
