pub mod auth_flow;
pub mod configs;
pub mod public;
pub mod traders;
