pub mod db;
pub mod paths;

pub use db::{SessionFilter, SessionPatch, Store, StoreError, StoreTx};
pub use paths::{bootstrap_ken_root, discover_ken_root, KenPaths, KEN_DIR_NAME};
