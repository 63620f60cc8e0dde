pub mod aggregate;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod cursor;
pub mod error;
pub mod loader;
pub mod normalize;
pub mod query;
pub mod resolver;
pub mod sanitize;
pub mod upstream;


pub use connector::{Connector, QueryResult};
pub use error::{ConnectorError, Result};
pub use sanitize::sanitize;
