use thiserror::Error;

pub mod backend;

/// Prelude module to automatically include all necessary traits
pub mod prelude {
    pub use super::{Db, KvDatabase, KvHandle, RawRead, RawWrite, RoCursor, RoTx, RwTx, Tx};
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("The key already exists.")]
    KeyExist,
    #[error("The data is corrupted.")]
    Corrupted,
    #[error("The database '{0}' was not found.")]
    DbNotFound(String),
    #[error("The argument is invalid.")]
    InvalidArgument,
    #[error("An I/O error occurred.")]
    IOError,
    #[error("The resource is busy - {0}")]
    Busy(String),
    #[error("An unknown error occurred.")]
    Unknown,
    #[error("Other error: {0}")]
    Other(String),
}

/// Marker trait representing a key-value database.
///
/// Implementing this trait indicates that a type can function as a named
/// database within the key-value store system.
pub trait KvDatabase {}

/// Trait representing a handle to a database.
///
/// The handle is used in transaction operations to specify which database to
/// interact with, so the same transaction methods can operate on different
/// sub-databases.
pub trait KvHandle<DB>: Send + Sync
where
    DB: KvDatabase,
{
    /// Returns a reference to the underlying database object.
    fn db(&self) -> &DB;
}

/// Trait representing a generic transaction.
///
/// Transactions provide a context for executing a series of database
/// operations atomically: all operations within the transaction are either
/// fully applied or completely discarded.
pub trait Tx: Sized {
    /// Commits the transaction, applying all changes made during it.
    fn commit(self) -> Result<(), Error>;

    /// Aborts the transaction, discarding all changes made during it.
    ///
    /// Dropping an uncommitted transaction has the same effect, which is what
    /// callers rely on when they bail out of a write with `?`.
    fn abort(self);
}

/// Trait for reading raw data from the database within a transaction.
pub trait RawRead<'env, DB>
where
    DB: KvDatabase,
{
    /// Reads the raw bytes associated with the given key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn read(&self, db: &impl KvHandle<DB>, key: &impl AsRef<[u8]>) -> Result<Option<&[u8]>, Error>;
}

/// Trait for writing raw data to the database within a transaction.
pub trait RawWrite<'env, DB>
where
    DB: KvDatabase,
{
    /// Writes raw bytes under the given key, overwriting an existing value.
    fn write(
        &mut self,
        db: &impl KvHandle<DB>,
        key: &impl AsRef<[u8]>,
        data: &impl AsRef<[u8]>,
    ) -> Result<(), Error>;

    /// Deletes the key-value pair associated with the given key.
    ///
    /// Deleting a missing key is not an error.
    fn delete(&mut self, db: &impl KvHandle<DB>, key: &impl AsRef<[u8]>) -> Result<(), Error>;
}

/// Trait representing a read-only cursor over the database within a transaction.
///
/// Keys iterate in lexicographic byte order, which the callers use for
/// prefix-organized key spaces (listings and queue scans).
pub trait RoCursor<'txn, DB: KvDatabase> {
    /// Iterator type over key-value pairs.
    ///
    /// The iterator borrows data for the lifetime `'txn`, ensuring that data
    /// remains valid for the duration of the transaction.
    type Iter: Iterator<Item = (&'txn [u8], &'txn [u8])>;

    /// Iterate over database items starting from the beginning of the database.
    fn iter_start(&mut self) -> Self::Iter;

    /// Iterate over database items starting from the given key.
    fn iter_from<K>(&mut self, key: &K) -> Self::Iter
    where
        K: AsRef<[u8]>;
}

/// Trait representing a read-only transaction.
pub trait RoTx<'env, DB>: Tx + RawRead<'env, DB>
where
    DB: KvDatabase,
{
    /// Cursor type for iterating over key-value pairs within the transaction.
    ///
    /// The cursor is bound by the lifetime `'txn`, which cannot outlive the
    /// transaction.
    type Cursor<'txn>: RoCursor<'txn, DB>
    where
        Self: 'txn;

    /// Creates a read-only cursor for the given database handle.
    fn ro_cursor<'txn>(&'txn self, db: &impl KvHandle<DB>) -> Result<Self::Cursor<'txn>, Error>;
}

/// Trait representing a read-write transaction.
pub trait RwTx<'env, DB>: Tx + RawWrite<'env, DB> + RawRead<'env, DB>
where
    DB: KvDatabase,
{
}

/// Trait representing the key-value database environment.
///
/// Provides methods to open sub-databases and begin transactions. The
/// environment encapsulates the overall state of the database system.
pub trait Db: Clone + Send + Sync {
    type DB: KvDatabase;

    /// Handle type for a sub-database.
    type Handle: KvHandle<Self::DB>;

    /// Read-only transaction type.
    type RoTx<'env>: RoTx<'env, Self::DB>
    where
        Self: 'env;

    /// Read-write transaction type.
    type RwTx<'env>: RwTx<'env, Self::DB>
    where
        Self: 'env;

    /// Opens an existing sub-database with the given name.
    fn open_sub_db(&self, name: &str) -> Result<Self::Handle, Error>;

    /// Creates a sub-database with the given name.
    ///
    /// If the sub-database already exists, this opens it.
    fn create_sub_db(&self, name: &str) -> Result<Self::Handle, Error>;

    /// Begins a new read-only transaction.
    fn begin_ro_txn(&self) -> Result<Self::RoTx<'_>, Error>;

    /// Begins a new read-write transaction.
    fn begin_rw_txn(&self) -> Result<Self::RwTx<'_>, Error>;
}
