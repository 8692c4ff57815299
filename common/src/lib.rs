pub mod config;
pub mod frame;
pub mod multipart;
pub mod planes;
