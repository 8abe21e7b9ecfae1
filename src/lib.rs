pub mod commands;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod engine;
pub mod homie;
pub mod output;
pub mod speed;
pub mod status;
