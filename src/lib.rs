pub mod combine;
pub mod config;
pub mod documents;
pub mod domain;
pub mod error;
pub mod filter;
pub mod identity;
pub mod idservice;
pub mod output;
pub mod pipeline;
pub mod publish;
pub mod record;
pub mod report;
pub mod schema;
pub mod search;
pub mod source;
