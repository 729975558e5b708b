pub mod artifact;
pub mod config;
pub mod ipc;
pub mod supervisor;
