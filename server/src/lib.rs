pub mod config;
pub mod orchestrator;
pub mod service;
pub mod session;
pub mod sim;
pub mod storage;
