//! Per-peer message queues.
//!
//! The core appends outbound messages here at turn commit; the transport
//! drains them (retry-forever, retiring a message only on ACK) and feeds the
//! inbound side. Sequence numbers are per peer per direction and strictly
//! monotonic - they are assigned from counters that only ever move forward,
//! so FIFO order survives restarts and partial drains.
//!
//! Key layout inside the queue sub-database (swissnums never contain `/`):
//!
//! ```text
//! out/<peer-vatid>/<be64 seq>  -> payload
//! out-next/<peer-vatid>        -> be64 next seq to assign
//! in/<from-vatid>/<be64 seq>   -> payload
//! in-next/<from-vatid>         -> be64 next seq to assign
//! ```
//!
//! A message is "pending" while its row exists; processing the inbound side
//! deletes the row, which is the cursor advance.

use vatrun_id_types::VatId;
use vatrun_kv_store::prelude::*;

use crate::error::{Error, Result};
use crate::QUEUE_SUB_DB;

const OUT_PREFIX: &str = "out/";
const OUT_NEXT_PREFIX: &str = "out-next/";
const IN_PREFIX: &str = "in/";
const IN_NEXT_PREFIX: &str = "in-next/";

/// An undelivered inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: VatId,
    pub seq: u64,
    pub payload: Vec<u8>,
}

fn msg_key(prefix: &str, peer: &VatId, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + peer.as_str().len() + 9);
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(peer.as_str().as_bytes());
    key.push(b'/');
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn peer_prefix(prefix: &str, peer: &VatId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + peer.as_str().len() + 1);
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(peer.as_str().as_bytes());
    key.push(b'/');
    key
}

fn counter_key(prefix: &str, peer: &VatId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + peer.as_str().len());
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(peer.as_str().as_bytes());
    key
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::msg("corrupt queue sequence number"))?;
    Ok(u64::from_be_bytes(arr))
}

/// Assigns the peer's next sequence number and stores the message under it.
///
/// Runs inside the caller's transaction - for outbound messages that is the
/// turn's commit transaction, so a rolled-back turn enqueues nothing.
fn enqueue<S: Db>(
    db_ptr: &S::Handle,
    txn: &mut S::RwTx<'_>,
    prefix: &str,
    next_prefix: &str,
    peer: &VatId,
    payload: &[u8],
) -> Result<u64> {
    let counter = counter_key(next_prefix, peer);
    let seq = match txn.read(db_ptr, &counter)? {
        Some(bytes) => decode_seq(bytes)?,
        None => 0,
    };
    txn.write(db_ptr, &msg_key(prefix, peer, seq), &payload)?;
    txn.write(db_ptr, &counter, &(seq + 1).to_be_bytes())?;
    Ok(seq)
}

pub fn enqueue_outbound<S: Db>(
    db_ptr: &S::Handle,
    txn: &mut S::RwTx<'_>,
    peer: &VatId,
    payload: &[u8],
) -> Result<u64> {
    enqueue::<S>(db_ptr, txn, OUT_PREFIX, OUT_NEXT_PREFIX, peer, payload)
}

/// Transport-side entry point: appends a message to the inbound queue.
pub fn enqueue_inbound<S: Db>(db: &S, from: &VatId, payload: &[u8]) -> Result<u64> {
    let db_ptr = db.open_sub_db(QUEUE_SUB_DB)?;
    let mut txn = db.begin_rw_txn()?;
    let seq = enqueue::<S>(&db_ptr, &mut txn, IN_PREFIX, IN_NEXT_PREFIX, from, payload)?;
    txn.commit()?;
    Ok(seq)
}

/// Lists the unACKed outbound messages for one peer, in sequence order.
pub fn peek_outbound<S: Db>(db: &S, peer: &VatId) -> Result<Vec<(u64, Vec<u8>)>> {
    let db_ptr = db.open_sub_db(QUEUE_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let prefix = peer_prefix(OUT_PREFIX, peer);
    let mut out = Vec::new();
    {
        let mut cursor = txn.ro_cursor(&db_ptr)?;
        for (key, value) in cursor.iter_from(&prefix) {
            if !key.starts_with(&prefix) {
                break;
            }
            let seq = decode_seq(&key[prefix.len()..])?;
            out.push((seq, value.to_vec()));
        }
    }
    txn.commit()?;
    Ok(out)
}

/// Retires one outbound message after the peer ACKed it.
pub fn ack_outbound<S: Db>(db: &S, peer: &VatId, seq: u64) -> Result<()> {
    let db_ptr = db.open_sub_db(QUEUE_SUB_DB)?;
    let mut txn = db.begin_rw_txn()?;
    txn.delete(&db_ptr, &msg_key(OUT_PREFIX, peer, seq))?;
    txn.commit()?;
    Ok(())
}

/// Returns the next undelivered inbound message, if any.
///
/// Within one peer this is strictly FIFO; across peers the lowest vatid
/// drains first, which is as good an arbitrary-but-stable order as any.
pub fn next_inbound<S: Db>(db: &S) -> Result<Option<InboundMessage>> {
    let db_ptr = db.open_sub_db(QUEUE_SUB_DB)?;
    let txn = db.begin_ro_txn()?;
    let mut found = None;
    {
        let mut cursor = txn.ro_cursor(&db_ptr)?;
        for (key, value) in cursor.iter_from(&IN_PREFIX.as_bytes()) {
            if !key.starts_with(IN_PREFIX.as_bytes()) {
                break;
            }
            let rest = &key[IN_PREFIX.len()..];
            let slash = rest
                .iter()
                .position(|&b| b == b'/')
                .ok_or_else(|| Error::msg("corrupt queue key"))?;
            let from = std::str::from_utf8(&rest[..slash])
                .ok()
                .and_then(|s| VatId::parse_str(s).ok())
                .ok_or_else(|| Error::msg("corrupt queue key"))?;
            let seq = decode_seq(&rest[slash + 1..])?;
            found = Some(InboundMessage {
                from,
                seq,
                payload: value.to_vec(),
            });
            break;
        }
    }
    txn.commit()?;
    Ok(found)
}

/// Consumes one inbound message after its delivery succeeded (or was
/// deliberately dropped). This is the inbound cursor advance; it runs after
/// the turn's own transaction committed.
pub fn remove_inbound<S: Db>(db: &S, from: &VatId, seq: u64) -> Result<()> {
    let db_ptr = db.open_sub_db(QUEUE_SUB_DB)?;
    let mut txn = db.begin_rw_txn()?;
    txn.delete(&db_ptr, &msg_key(IN_PREFIX, from, seq))?;
    txn.commit()?;
    Ok(())
}
