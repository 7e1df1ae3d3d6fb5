#![doc = include_str!("README.md")]

pub mod backend;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod query;
pub mod repository;

#[doc(inline)]
pub use backend::{
    BackendError, BackendResult, Document, DocumentBackend, DocumentCallback, DocumentData,
    SnapshotCallback, WriteOperation,
};
#[doc(inline)]
pub use error::{map_backend_error, DatabaseError, DatabaseErrorKind, DatabaseResult};
#[doc(inline)]
pub use gateway::{BatchOperation, DocumentGateway};
#[doc(inline)]
pub use memory::InMemoryBackend;
#[doc(inline)]
pub use query::{FilterOperator, OrderBy, OrderDirection, QueryOptions, SearchFilter};
#[doc(inline)]
pub use repository::{StaffRepository, UserRepository};
