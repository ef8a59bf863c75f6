pub mod config;
pub mod events;
pub mod gateway;
pub mod instance;
pub mod ipc;
pub mod logfile;
pub mod supervisor;
pub mod utils;
