#![doc = include_str!("README.md")]

pub mod config;
pub mod error;
mod service;

#[doc(inline)]
pub use config::DataServiceConfig;
#[doc(inline)]
pub use error::{DataError, DataErrorCode, DataResult};
pub use service::{DataService, DataServiceBuilder, DataServiceState, DataServiceStateCallback};
