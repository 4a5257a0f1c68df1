pub mod blobstore;
pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod transport;

pub use error::Fault;
