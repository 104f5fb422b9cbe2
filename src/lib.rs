pub mod catalog;
pub mod config;
pub mod errors;
pub mod models;
pub mod streaming;
pub mod utils;
pub mod web;
