pub mod app;
pub mod config;
pub mod crawler;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod flatten;
pub mod geometry;
pub mod http;
pub mod output;
pub mod reconcile;
pub mod road_reference;
pub mod schema;
pub mod sink;
pub mod store;
pub mod tables;
