pub mod chain;
pub mod config;
pub mod error;
pub mod hash;
pub mod objects;
pub mod options;
pub mod query;
pub mod record;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use options::{StoreOption, UseConnection};
pub use query::{Query, Scope};
pub use record::{Expr, QueryParams, Record};
pub use store::{Conn, Store, TxState};
