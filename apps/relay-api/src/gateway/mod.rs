pub mod fanout;
pub mod mirror;
pub mod presence;
pub mod relay;
pub mod server;
pub mod session;
