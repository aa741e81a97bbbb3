pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod models;
pub mod services;
