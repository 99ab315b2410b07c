//! Warehouse side of the pipeline: sessions, pooling, the stage-and-copy
//! loader, and post-load completeness validation.

pub mod completeness;
pub mod copy;
pub mod ident;
pub mod loader;
pub mod pool;
pub mod session;

pub use completeness::{CompletenessError, CompletenessRequest, CompletenessValidator};
pub use ident::{validate_identifier, IdentError};
pub use loader::{CopyTicket, LoadError, LoadErrorKind, LoadReceipt, LoaderConfig, WarehouseLoader};
pub use pool::{ConnectionPool, PoolError, PooledSession};
pub use session::{Connector, CopyStatus, ExecResult, Row, Session, SessionError, SqlValue};
