pub mod config;
pub mod messages;
pub mod presence;
pub mod session;
