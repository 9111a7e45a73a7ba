// Per-call options and their resolution

use crate::store::Store;

/// Run a call on an explicit store handle, typically one returned by
/// `Store::begin`.
#[derive(Debug, Clone)]
pub struct UseConnection {
    pub db: Store,
    /// Commit (or roll back on error) the handle once the call returns.
    pub finish: bool,
}

#[derive(Debug, Clone)]
pub enum StoreOption {
    UseConnection(UseConnection),
}

impl StoreOption {
    pub fn use_connection(db: &Store, finish: bool) -> Self {
        StoreOption::UseConnection(UseConnection {
            db: db.clone(),
            finish,
        })
    }
}

/// Pick the handle a call should run on and whether the callee finalizes it.
///
/// The first `UseConnection` option wins. Without one, the fallback is
/// returned and finalization stays with the caller.
pub fn resolve(opts: &[StoreOption], fallback: Option<&Store>) -> (Option<Store>, bool) {
    for opt in opts {
        match opt {
            StoreOption::UseConnection(use_conn) => {
                return (Some(use_conn.db.clone()), use_conn.finish);
            }
        }
    }
    (fallback.cloned(), false)
}
