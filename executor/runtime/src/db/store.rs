//! Typed access to the persistent entity rows.
//!
//! Urbjects are stored as binary records, powers and memories as the raw
//! JSON documents the pack layer produces. Read helpers run their own
//! read-only transaction; write helpers take the caller's write transaction,
//! because entity writes only ever happen inside a larger atomic unit (a
//! turn commit or an admin operation).

use serde::{Deserialize, Serialize};
use vatrun_id_types::{MemoryId, PowerId, UrbjectId};
use vatrun_kv_store::prelude::*;

use crate::error::{Error, Result};
use crate::{MEMORY_SUB_DB, POWER_SUB_DB, URBJECT_SUB_DB};

/// Stored urbject row: the immutable binding of guest code to its authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrbjectRecord {
    pub powid: PowerId,
    pub code: String,
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::msg(format!("stored {what} is not utf-8")))
}

pub fn read_urbject<S: Db>(db: &S, urbjid: &UrbjectId) -> Result<Option<UrbjectRecord>> {
    let db_ptr = db.open_sub_db(URBJECT_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let record = match txn.read(&db_ptr, urbjid)? {
        Some(bytes) => Some(postcard::from_bytes(bytes)?),
        None => None,
    };
    txn.commit()?;
    Ok(record)
}

pub fn write_urbject<S: Db>(
    db_ptr: &S::Handle,
    txn: &mut S::RwTx<'_>,
    urbjid: &UrbjectId,
    record: &UrbjectRecord,
) -> Result<()> {
    let bytes = postcard::to_allocvec(record)?;
    txn.write(db_ptr, urbjid, &bytes)?;
    Ok(())
}

pub fn read_power<S: Db>(db: &S, powid: &PowerId) -> Result<Option<String>> {
    let db_ptr = db.open_sub_db(POWER_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let power_json = match txn.read(&db_ptr, powid)? {
        Some(bytes) => Some(utf8(bytes, "power")?),
        None => None,
    };
    txn.commit()?;
    Ok(power_json)
}

pub fn write_power<S: Db>(
    db_ptr: &S::Handle,
    txn: &mut S::RwTx<'_>,
    powid: &PowerId,
    power_json: &str,
) -> Result<()> {
    txn.write(db_ptr, powid, &power_json.as_bytes())?;
    Ok(())
}

pub fn read_memory<S: Db>(db: &S, memid: &MemoryId) -> Result<Option<String>> {
    let db_ptr = db.open_sub_db(MEMORY_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let data_json = match txn.read(&db_ptr, memid)? {
        Some(bytes) => Some(utf8(bytes, "memory")?),
        None => None,
    };
    txn.commit()?;
    Ok(data_json)
}

pub fn write_memory<S: Db>(
    db_ptr: &S::Handle,
    txn: &mut S::RwTx<'_>,
    memid: &MemoryId,
    data_json: &str,
) -> Result<()> {
    txn.write(db_ptr, memid, &data_json.as_bytes())?;
    Ok(())
}

pub fn list_urbjects<S: Db>(db: &S) -> Result<Vec<UrbjectId>> {
    let db_ptr = db.open_sub_db(URBJECT_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let mut out = Vec::new();
    {
        let mut cursor = txn.ro_cursor(&db_ptr)?;
        for (key, _value) in cursor.iter_start() {
            let urbjid = std::str::from_utf8(key)
                .ok()
                .and_then(|s| UrbjectId::parse_str(s).ok())
                .ok_or_else(|| Error::msg("failed to parse urbjid from storage"))?;
            out.push(urbjid);
        }
    }
    txn.commit()?;
    Ok(out)
}

pub fn list_memories<S: Db>(db: &S) -> Result<Vec<MemoryId>> {
    let db_ptr = db.open_sub_db(MEMORY_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let mut out = Vec::new();
    {
        let mut cursor = txn.ro_cursor(&db_ptr)?;
        for (key, _value) in cursor.iter_start() {
            let memid = std::str::from_utf8(key)
                .ok()
                .and_then(|s| MemoryId::parse_str(s).ok())
                .ok_or_else(|| Error::msg("failed to parse memid from storage"))?;
            out.push(memid);
        }
    }
    txn.commit()?;
    Ok(out)
}
