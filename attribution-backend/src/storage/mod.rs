//! Durable storage for sources, reports and rate limits.

pub mod db;
pub mod resolver;
pub mod rules;

pub use db::Db;
pub use resolver::SqliteResolver;
