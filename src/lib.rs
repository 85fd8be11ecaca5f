pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod media;
pub mod models;
pub mod store;
pub mod sync;
pub mod systems;
pub mod weather;

pub use config::Config;
pub use context::{AppContext, ContextOptions};
pub use coordinator::{Coordinator, Notice, NoticeAction, NoticeKind};
pub use error::{Error, Result};
pub use store::LocalStore;
pub use sync::{DrainOutcome, DrainReport, SyncEngine, SyncPolicy};
