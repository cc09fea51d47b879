pub mod commenter;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod github;
pub mod handlers;
pub mod processor;
pub mod server_config;
