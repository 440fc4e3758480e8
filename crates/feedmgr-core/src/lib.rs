pub mod access;
pub mod authz;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod io;
pub mod lookup;
pub mod paths;
pub mod properties;
pub mod provision;
pub mod secrets;
pub mod store;
pub mod types;

pub use error::{FeedMgrError, Result};
