pub mod analysis;
pub mod config;
pub mod errors;
pub mod extract;
pub mod lifecycle;
pub mod logging;
pub mod repo;
pub mod server;
pub mod util;
