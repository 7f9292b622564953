pub mod db;
pub mod error;
pub mod pack;
pub mod script;
pub mod turn;
pub mod value;
pub mod vat;

pub use error::{Error, Result};
pub use turn::{Invocation, Turn};
pub use value::{NativeName, Value};
pub use vat::{Envelope, Vat};

/// Sub-Database holding the urbject rows
pub const URBJECT_SUB_DB: &str = "urbject-db";

/// Sub-Database holding the power documents
pub const POWER_SUB_DB: &str = "power-db";

/// Sub-Database holding the memory contents
pub const MEMORY_SUB_DB: &str = "memory-db";

/// Sub-Database holding the per-peer message queues
pub const QUEUE_SUB_DB: &str = "queue-db";

/// Sub-Database holding the node configuration
pub const NODE_SUB_DB: &str = "node-db";

/// Number of named sub-databases a vat environment needs
pub const MAX_SUB_DBS: u32 = 8;
