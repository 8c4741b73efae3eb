pub mod cache;
pub mod classifier;
pub mod composer;
pub mod config;
pub mod gateway;
pub mod json_extract;
pub mod news;
pub mod pipeline;
pub mod schema;
pub mod themes;
