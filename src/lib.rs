pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod filter;
pub mod flow;
pub mod network;
pub mod plugin;
pub mod storage;
