pub mod alleles;
pub mod app;
pub mod associations;
pub mod backend;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod domain;
pub mod error;
pub mod input;
pub mod merge;
pub mod output;
pub mod populations;
pub mod retry;
pub mod store;
