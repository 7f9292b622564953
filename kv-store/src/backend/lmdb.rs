use std::{path::Path, sync::Arc};

use crate::{Db, Error, KvDatabase, KvHandle, RawRead, RawWrite, RoCursor, RoTx, RwTx, Tx};

/// Converts LMDB-specific errors into the database interface `Error` type.
///
/// Note: `NotFound` is not an error in the interface - reads report a missing
/// key through the `Option` type and deletes ignore it - so the read/delete
/// implementations below handle `NotFound` before converting.
impl From<lmdb::Error> for Error {
    fn from(value: lmdb::Error) -> Error {
        match value {
            lmdb::Error::KeyExist => Error::KeyExist,
            lmdb::Error::NotFound => Error::Other("key not found".to_string()),
            lmdb::Error::PageNotFound => Error::Other("database page not found".to_string()),
            lmdb::Error::Corrupted => Error::Corrupted,
            lmdb::Error::Panic => Error::Other("panic occured".to_string()),
            lmdb::Error::VersionMismatch => Error::Other("version mismatch".to_string()),
            lmdb::Error::Invalid => Error::InvalidArgument,
            lmdb::Error::MapResized => Error::Other("map resized".to_string()),
            lmdb::Error::Incompatible => Error::Other("incompatible format".to_string()),
            lmdb::Error::BadRslot => Error::Other("bad reader slot".to_string()),
            lmdb::Error::BadTxn => Error::Other("bad transaction".to_string()),
            lmdb::Error::BadValSize => Error::Other("bad value size".to_string()),
            lmdb::Error::BadDbi => Error::Other("bad database index".to_string()),
            lmdb::Error::Other(code) => Error::Other(format!("unknown lmdb error code: {}", code)),
            e => Error::Busy(e.to_string()),
        }
    }
}

/// Marks LMDB's `Database` type as implementing the `KvDatabase` trait.
impl KvDatabase for lmdb::Database {}

/// Represents a handle to an LMDB sub-database.
pub struct LmdbHandle {
    db: lmdb::Database,
}

impl LmdbHandle {
    pub fn new(db: lmdb::Database) -> LmdbHandle {
        LmdbHandle { db }
    }
}

impl KvHandle<lmdb::Database> for LmdbHandle {
    fn db(&self) -> &lmdb::Database {
        &self.db
    }
}

/// An LMDB environment for managing sub-databases and transactions.
///
/// Write transactions are fully durable: the environment runs with default
/// flags, so a committed transaction has been synced to disk. This is what
/// backs the all-or-nothing commit of a turn.
#[derive(Clone)]
pub struct Lmdb {
    env: Arc<lmdb::Environment>,
}

impl Lmdb {
    /// Initializes a new LMDB environment at the given path with a maximum
    /// number of named sub-databases.
    pub fn new(path: &Path, max_dbs: u32) -> Result<Lmdb, Error> {
        let env = lmdb::Environment::new()
            .set_max_dbs(max_dbs)
            // NOTE: we have to maintain the map size in future. A mechanism
            // to increase this size is a good idea.
            .set_map_size(1_099_511_627_776)
            .set_max_readers(2048)
            .open(path)?;

        Ok(Lmdb { env: Arc::new(env) })
    }
}

impl Db for Lmdb {
    type DB = lmdb::Database;
    type Handle = LmdbHandle;
    type RoTx<'env> = lmdb::RoTransaction<'env>;
    type RwTx<'env> = lmdb::RwTransaction<'env>;

    /// Opens a sub-database by name, or the default database for "default".
    fn open_sub_db(&self, name: &str) -> Result<Self::Handle, Error> {
        let res = if name.eq_ignore_ascii_case("default") {
            self.env.open_db(None)
        } else {
            self.env.open_db(Some(name))
        };

        let db = match res {
            Ok(db) => db,
            Err(lmdb::Error::NotFound) => return Err(Error::DbNotFound(name.to_string())),
            Err(e) => return Err(Error::from(e)),
        };

        Ok(LmdbHandle::new(db))
    }

    /// Creates a sub-database by name, or opens it if it already exists.
    fn create_sub_db(&self, name: &str) -> Result<Self::Handle, Error> {
        let db = if name.eq_ignore_ascii_case("default") {
            self.env.create_db(None, lmdb::DatabaseFlags::empty())?
        } else {
            self.env
                .create_db(Some(name), lmdb::DatabaseFlags::empty())?
        };

        Ok(LmdbHandle::new(db))
    }

    fn begin_ro_txn(&self) -> Result<Self::RoTx<'_>, Error> {
        let txn = self.env.begin_ro_txn()?;
        Ok(txn)
    }

    fn begin_rw_txn(&self) -> Result<Self::RwTx<'_>, Error> {
        let txn = self.env.begin_rw_txn()?;
        Ok(txn)
    }
}

impl<'env> Tx for lmdb::RoTransaction<'env> {
    fn commit(self) -> Result<(), Error> {
        <Self as lmdb::Transaction>::commit(self)?;
        Ok(())
    }

    fn abort(self) {
        <Self as lmdb::Transaction>::abort(self);
    }
}

impl<'env> RawRead<'env, lmdb::Database> for lmdb::RoTransaction<'env> {
    fn read(
        &self,
        db: &impl KvHandle<lmdb::Database>,
        key: &impl AsRef<[u8]>,
    ) -> Result<Option<&[u8]>, Error> {
        let res = <Self as lmdb::Transaction>::get(self, *db.db(), key);

        match res {
            Ok(buf) => Ok(Some(buf)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl<'env> RoTx<'env, lmdb::Database> for lmdb::RoTransaction<'env> {
    type Cursor<'txn>
        = lmdb::RoCursor<'txn>
    where
        Self: 'txn;

    fn ro_cursor<'txn>(
        &'txn self,
        db: &impl KvHandle<lmdb::Database>,
    ) -> Result<Self::Cursor<'txn>, Error> {
        let cursor = <Self as lmdb::Transaction>::open_ro_cursor(self, *db.db())?;
        Ok(cursor)
    }
}

/// Adapts `lmdb::Iter`, whose `Item` is `lmdb::Result<(&[u8], &[u8])>`, to the
/// plain-tuple `Item` required by `RoCursor::Iter`. Iteration stops at the
/// first error, mirroring how `lmdb::Iter` already turns `NotFound`/`EINVAL`
/// into a clean `None` internally.
pub struct LmdbIter<'txn>(lmdb::Iter<'txn>);

impl<'txn> Iterator for LmdbIter<'txn> {
    type Item = (&'txn [u8], &'txn [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()?.ok()
    }
}

impl<'txn> RoCursor<'txn, lmdb::Database> for lmdb::RoCursor<'txn> {
    type Iter = LmdbIter<'txn>;

    fn iter_start(&mut self) -> Self::Iter {
        LmdbIter(<Self as lmdb::Cursor>::iter_start(self))
    }

    fn iter_from<K>(&mut self, key: &K) -> Self::Iter
    where
        K: AsRef<[u8]>,
    {
        LmdbIter(<Self as lmdb::Cursor>::iter_from(self, key))
    }
}

impl<'env> Tx for lmdb::RwTransaction<'env> {
    fn commit(self) -> Result<(), Error> {
        <Self as lmdb::Transaction>::commit(self)?;
        Ok(())
    }

    fn abort(self) {
        <Self as lmdb::Transaction>::abort(self);
    }
}

impl<'env> RawRead<'env, lmdb::Database> for lmdb::RwTransaction<'env> {
    fn read(
        &self,
        db: &impl KvHandle<lmdb::Database>,
        key: &impl AsRef<[u8]>,
    ) -> Result<Option<&[u8]>, Error> {
        let res = <Self as lmdb::Transaction>::get(self, *db.db(), key);

        match res {
            Ok(buf) => Ok(Some(buf)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl<'env> RawWrite<'env, lmdb::Database> for lmdb::RwTransaction<'env> {
    fn write(
        &mut self,
        db: &impl KvHandle<lmdb::Database>,
        key: &impl AsRef<[u8]>,
        data: &impl AsRef<[u8]>,
    ) -> Result<(), Error> {
        self.put(*db.db(), key, &data, lmdb::WriteFlags::empty())?;
        Ok(())
    }

    fn delete(
        &mut self,
        db: &impl KvHandle<lmdb::Database>,
        key: &impl AsRef<[u8]>,
    ) -> Result<(), Error> {
        match self.del(*db.db(), key, None) {
            Ok(_) => Ok(()),
            Err(lmdb::Error::NotFound) => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl<'env> RwTx<'env, lmdb::Database> for lmdb::RwTransaction<'env> {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use tempfile::tempdir;

    const TEST_REPEATS: usize = 4;

    fn open_tmp_lmdb() -> (Lmdb, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let env = Lmdb::new(temp_dir.path(), 2).unwrap();
        (env, temp_dir)
    }

    #[test]
    fn read_write_delete() -> Result<(), Box<dyn std::error::Error>> {
        let (env, _tmp) = open_tmp_lmdb();
        let handle = env.create_sub_db("test")?;

        for _ in 0..TEST_REPEATS {
            let mut rng = rand::thread_rng();
            let test_key: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
            let test_data: Vec<u8> = (0..65536).map(|_| rng.gen()).collect();
            {
                // write test value to db
                let mut txn = env.begin_rw_txn()?;
                txn.write(&handle, &test_key, &test_data)?;
                Tx::commit(txn)?;
            }

            {
                // read test value from db
                let txn = env.begin_ro_txn()?;
                let res = txn.read(&handle, &test_key)?;
                assert!(res.is_some(), "failed to read value from db");
                assert_eq!(test_data, res.unwrap(), "data read is corrupted");
            }

            {
                // delete test value from db
                let mut txn = env.begin_rw_txn()?;
                txn.delete(&handle, &test_key)?;
                Tx::commit(txn)?;

                // try to read deleted value
                let txn = env.begin_ro_txn()?;
                let res = txn.read(&handle, &test_key)?;
                assert!(res.is_none(), "could read deleted value");
            }
        }
        Ok(())
    }

    #[test]
    fn not_found_is_none() -> Result<(), Box<dyn std::error::Error>> {
        let (env, _tmp) = open_tmp_lmdb();
        let handle = env.create_sub_db("test")?;

        let txn = env.begin_ro_txn()?;
        let not_found = txn.read(&handle, &[0, 0, 0, 0])?;
        assert!(not_found.is_none());
        Ok(())
    }

    #[test]
    fn dropped_txn_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
        let (env, _tmp) = open_tmp_lmdb();
        let handle = env.create_sub_db("test")?;

        {
            // write without committing - dropping the txn must discard it
            let mut txn = env.begin_rw_txn()?;
            txn.write(&handle, &b"key", &b"value")?;
        }
        let txn = env.begin_ro_txn()?;
        let res = txn.read(&handle, &b"key")?;
        assert!(res.is_none(), "uncommitted write must not be visible");
        Ok(())
    }

    #[test]
    fn cursor_iterates_in_key_order() -> Result<(), Box<dyn std::error::Error>> {
        let (env, _tmp) = open_tmp_lmdb();
        let handle = env.create_sub_db("test")?;

        let mut txn = env.begin_rw_txn()?;
        for key in [b"b/1", b"a/2", b"b/0", b"a/1"] {
            txn.write(&handle, key, &b"x")?;
        }
        Tx::commit(txn)?;

        let txn = env.begin_ro_txn()?;
        let mut cursor = txn.ro_cursor(&handle)?;
        let keys: Vec<Vec<u8>> = cursor.iter_start().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(
            keys,
            vec![
                b"a/1".to_vec(),
                b"a/2".to_vec(),
                b"b/0".to_vec(),
                b"b/1".to_vec()
            ]
        );

        let from: Vec<Vec<u8>> = cursor.iter_from(&b"b/").map(|(k, _)| k.to_vec()).collect();
        assert_eq!(from, vec![b"b/0".to_vec(), b"b/1".to_vec()]);
        Ok(())
    }

    #[test]
    fn non_existing_db() {
        let (env, _tmp) = open_tmp_lmdb();
        let db_name = "does-not-exist";
        let res = env.open_sub_db(db_name);
        assert!(res.is_err());
        if let Err(e) = res {
            match e {
                Error::DbNotFound(name) => {
                    assert_eq!(name, db_name, "error should include db-name")
                }
                _ => panic!("expected error 'DbNotFound'"),
            }
        }
    }
}
