// Data Engine Module
// Value types, errors and the collaborator traits the executors run on

pub mod drivers;
pub mod error;
pub mod metadata;
pub mod sql_generator;
pub mod traits;
pub mod types;

pub use error::{ExecutionError, ExecutionResult};
pub use metadata::{EntityDefinition, StaticMetadata};
pub use sql_generator::{AnsiSqlGenerator, SqlDialect};
pub use traits::{Backend, EntityMetadata, FsSourceReader, SourceReader, SqlGenerator};
pub use types::*;
