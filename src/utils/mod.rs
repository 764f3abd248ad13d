// src/utils/mod.rs
pub mod connectivity;
pub mod logging;
pub mod precision;
