pub mod config;
pub mod detection;
pub mod frame;
pub mod position;
