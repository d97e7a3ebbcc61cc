//! OliveTin library exports

pub mod acl;
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod entities;
pub mod events;
pub mod executor;
pub mod installation;
pub mod tpl;
pub mod triggers;
pub mod webhooks;

pub use app::Application;
