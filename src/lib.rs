pub mod api;
pub mod config;
pub mod kv_store;
pub mod link_params;
pub mod link_service;
mod orm;
pub mod provider;
pub mod routes;
