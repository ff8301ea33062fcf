pub mod analysis;
pub mod audit;
pub mod compare;
pub mod config;
pub mod features;
pub mod history;
pub mod output;
pub mod scoring;
pub mod server;
pub mod sources;
