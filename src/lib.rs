pub mod batch;
pub mod binning;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod enrichers;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod output;
pub mod rate_limit;
pub mod schema;
pub mod store;
pub mod taxonomy;
pub mod text;
