#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod analysis;
pub mod config;
pub mod events;
pub mod guard;
pub mod http;
pub mod package;
pub mod tls;
pub mod utils;
