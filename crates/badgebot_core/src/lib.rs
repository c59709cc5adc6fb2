pub mod classify;
pub mod config;
pub mod driver;
pub mod join;
pub mod model;
pub mod output;
pub mod query_service;
pub mod reconcile;
pub mod remote;
pub mod replica;
pub mod report;
pub mod runtime;
pub mod wikibase;
