pub mod action;
pub mod config;
pub mod event;
pub mod role;
pub mod wire;
