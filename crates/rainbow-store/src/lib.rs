pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::{KvStore, SqliteKvStore};
pub use types::Record;
