pub mod error;
pub mod writer;
pub mod merge;
pub mod watcher;
pub mod json_store;
pub mod schema;
pub mod row_store;
pub mod binding;
pub mod expiry;

pub use binding::{open_binding, require_key, AnyBinding, Backend, Binding};
pub use error::{BindingError, Result};
pub use json_store::{JsonStore, JsonStoreOptions, ShutdownHook, StoreState};
pub use row_store::{RowStore, RowStoreOptions};
pub use schema::TableSchema;
