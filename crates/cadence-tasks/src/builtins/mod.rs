pub mod download;
pub mod log;
pub mod mail;
pub mod sleep;
