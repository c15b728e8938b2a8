pub mod handlers;
pub mod middleware;
pub mod render;
pub mod search;
pub mod server;
