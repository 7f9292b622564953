//! The vat dispatch layer
//!
//! A [`Vat`] owns a storage handle and the node identity, and serializes
//! turns: the inbound queue is drained one message at a time, and a turn runs
//! from unpack through commit without yielding. The encrypted transport is an
//! external collaborator - this module only speaks its queue contract
//! ([`Vat::enqueue_inbound`] / [`Vat::take_outbound`]) and the JSON message
//! envelope.

use ed25519_dalek::SigningKey;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use vatrun_id_types::{MemoryId, PowerId, RefId, UrbjectId, VatId};
use vatrun_kv_store::prelude::*;

use crate::db::{queue, store};
use crate::error::{Error, ErrorKind, Result};
use crate::pack;
use crate::turn::Turn;
use crate::{MEMORY_SUB_DB, NODE_SUB_DB, POWER_SUB_DB, QUEUE_SUB_DB, URBJECT_SUB_DB};

const NODE_CONFIG_KEY: &[u8] = b"config";

/// Node identity row: the vat id and its Ed25519 signing key.
///
/// The signing key is what the transport uses to box traffic; the core only
/// mints and stores it.
#[derive(Serialize, Deserialize)]
struct NodeConfig {
    vat_id: VatId,
    signing_key: String,
}

/// Inter-vat message envelope.
///
/// `execute` runs one-shot code against an ad-hoc power built from a memid
/// plus the `make_urbject` grant (the admin/poke path); `invoke` is the
/// normal method invocation. Anything else is ignored with a log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Envelope {
    Execute {
        memid: MemoryId,
        code: String,
        args_json: String,
    },
    Invoke {
        urbjid: UrbjectId,
        args_json: String,
    },
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A vat: a persistent process identity hosting urbjects.
pub struct Vat<S: Db> {
    db: S,
    vat_id: VatId,
}

/// Everything stored about one urbject, for the admin dump commands.
#[derive(Debug)]
pub struct UrbjectDump {
    pub urbjid: UrbjectId,
    pub powid: PowerId,
    pub power_json: String,
    pub code: String,
}

impl<S: Db> Vat<S> {
    /// Initializes a fresh vat: creates the sub-databases, mints the node
    /// keypair and derives the vat identity from its public half.
    pub fn create(db: S) -> Result<Self> {
        for name in [
            URBJECT_SUB_DB,
            POWER_SUB_DB,
            MEMORY_SUB_DB,
            QUEUE_SUB_DB,
            NODE_SUB_DB,
        ] {
            db.create_sub_db(name)?;
        }
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let vat_id = VatId::from_verifying_key(&signing_key.verifying_key());
        let config = NodeConfig {
            vat_id: vat_id.clone(),
            signing_key: hex::encode(signing_key.to_bytes()),
        };
        let node_ptr = db.open_sub_db(NODE_SUB_DB)?;
        let mut txn = db.begin_rw_txn()?;
        txn.write(&node_ptr, &NODE_CONFIG_KEY, &postcard::to_allocvec(&config)?)?;
        txn.commit()?;
        info!("created vat {vat_id}");
        Ok(Vat { db, vat_id })
    }

    /// Opens an existing vat from its storage.
    pub fn open(db: S) -> Result<Self> {
        let node_ptr = match db.open_sub_db(NODE_SUB_DB) {
            Ok(ptr) => ptr,
            Err(vatrun_kv_store::Error::DbNotFound(_)) => {
                return Err(ErrorKind::MissingNodeConfig.into())
            }
            Err(e) => return Err(e.into()),
        };
        let txn = db.begin_ro_txn()?;
        let config: NodeConfig = match txn.read(&node_ptr, &NODE_CONFIG_KEY)? {
            Some(bytes) => postcard::from_bytes(bytes)?,
            None => return Err(ErrorKind::MissingNodeConfig.into()),
        };
        txn.commit()?;
        Ok(Vat {
            db,
            vat_id: config.vat_id,
        })
    }

    pub fn id(&self) -> &VatId {
        &self.vat_id
    }

    pub fn db(&self) -> &S {
        &self.db
    }

    // --- dispatch

    /// Processes one inbound message payload.
    ///
    /// Schema errors - unparsable JSON, unknown commands, missing fields -
    /// are logged and dropped (`Ok`), so a poison message cannot wedge the
    /// queue. A failing *turn* is an error: the caller keeps the message
    /// unacknowledged and it will be redelivered.
    pub fn deliver(&self, from: &VatId, payload: &[u8]) -> Result<()> {
        let json: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!("dropping malformed message from {from}: {e}");
                return Ok(());
            }
        };
        let command = json
            .get("command")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        if command != "execute" && command != "invoke" {
            info!("ignored command '{command}'");
            return Ok(());
        }
        let envelope: Envelope = match serde_json::from_value(json) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed '{command}' message from {from}: {e}");
                return Ok(());
            }
        };
        match envelope {
            Envelope::Execute {
                memid,
                code,
                args_json,
            } => {
                let mut turn = Turn::new(self.vat_id.clone(), &self.db);
                let powid = turn.create_power_for_memid(Some(&memid), true);
                turn.start_turn(&code, &powid, &args_json, from)?;
            }
            Envelope::Invoke { urbjid, args_json } => {
                let record = store::read_urbject(&self.db, &urbjid)?
                    .ok_or(ErrorKind::MissingUrbject { urbjid })?;
                let turn = Turn::new(self.vat_id.clone(), &self.db);
                turn.start_turn(&record.code, &record.powid, &args_json, from)?;
            }
        }
        Ok(())
    }

    /// Drains the inbound queue, one turn at a time, in sequence order.
    ///
    /// Returns the number of messages consumed. A failing turn stops the
    /// drain and leaves its message in place for the next attempt.
    pub fn drain_inbound(&self) -> Result<u32> {
        let mut delivered = 0;
        while let Some(msg) = queue::next_inbound(&self.db)? {
            self.deliver(&msg.from, &msg.payload)?;
            queue::remove_inbound(&self.db, &msg.from, msg.seq)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    // --- transport surface

    /// Transport-side: appends a message to this vat's inbound queue.
    pub fn enqueue_inbound(&self, from: &VatId, payload: &[u8]) -> Result<u64> {
        queue::enqueue_inbound(&self.db, from, payload)
    }

    /// Transport-side: takes (and retires) every pending outbound message for
    /// one peer, in sequence order. The real transport ACKs per message; this
    /// all-at-once form is what loopback delivery and tests need.
    pub fn take_outbound(&self, peer: &VatId) -> Result<Vec<Vec<u8>>> {
        let pending = queue::peek_outbound(&self.db, peer)?;
        let mut payloads = Vec::with_capacity(pending.len());
        for (seq, payload) in pending {
            queue::ack_outbound(&self.db, peer, seq)?;
            payloads.push(payload);
        }
        Ok(payloads)
    }

    // --- admin surface (consumed by the CLI)

    /// Creates a memory with the given initial JSON contents.
    pub fn create_memory(&self, initial_json: &str) -> Result<MemoryId> {
        serde_json::from_str::<serde_json::Value>(initial_json)?;
        let memid = MemoryId::generate();
        let memory_ptr = self.db.open_sub_db(MEMORY_SUB_DB)?;
        let mut txn = self.db.begin_rw_txn()?;
        store::write_memory::<S>(&memory_ptr, &mut txn, &memid, initial_json)?;
        txn.commit()?;
        Ok(memid)
    }

    /// Creates an urbject from source code, granting it `make_urbject` and
    /// optionally a memory. Returns its globally-qualified address.
    pub fn create_urbject(&self, code: &str, memid: Option<&MemoryId>) -> Result<RefId> {
        if let Some(memid) = memid {
            store::read_memory(&self.db, memid)?.ok_or_else(|| ErrorKind::MissingMemory {
                memid: memid.clone(),
            })?;
        }
        let powid = PowerId::generate();
        let urbjid = UrbjectId::generate();
        let power_ptr = self.db.open_sub_db(POWER_SUB_DB)?;
        let urbject_ptr = self.db.open_sub_db(URBJECT_SUB_DB)?;
        let mut txn = self.db.begin_rw_txn()?;
        store::write_power::<S>(&power_ptr, &mut txn, &powid, &pack::power_document(memid, true))?;
        store::write_urbject::<S>(
            &urbject_ptr,
            &mut txn,
            &urbjid,
            &store::UrbjectRecord {
                powid,
                code: code.to_string(),
            },
        )?;
        txn.commit()?;
        Ok(RefId::new(self.vat_id.clone(), urbjid))
    }

    pub fn list_memories(&self) -> Result<Vec<MemoryId>> {
        store::list_memories(&self.db)
    }

    pub fn list_urbjects(&self) -> Result<Vec<UrbjectId>> {
        store::list_urbjects(&self.db)
    }

    /// Returns the raw stored contents of a memory.
    pub fn dump_memory(&self, memid: &MemoryId) -> Result<String> {
        store::read_memory(&self.db, memid)?.ok_or_else(|| {
            ErrorKind::MissingMemory {
                memid: memid.clone(),
            }
            .into()
        })
    }

    /// Returns the stored urbject row together with its power document.
    pub fn dump_urbject(&self, urbjid: &UrbjectId) -> Result<UrbjectDump> {
        let record = store::read_urbject(&self.db, urbjid)?.ok_or_else(|| {
            ErrorKind::MissingUrbject {
                urbjid: urbjid.clone(),
            }
        })?;
        let power_json =
            store::read_power(&self.db, &record.powid)?.ok_or_else(|| ErrorKind::MissingPower {
                powid: record.powid.clone(),
            })?;
        Ok(UrbjectDump {
            urbjid: urbjid.clone(),
            powid: record.powid,
            power_json,
            code: record.code,
        })
    }

    /// Queues an `invoke` message to an urbject on this vat and returns
    /// without draining. Remote spids need the transport layer.
    pub fn send_invoke(&self, target: &RefId, args_json: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(args_json)?;
        if target.vat != self.vat_id {
            return Err(Error::msg(
                "sending to a remote vat requires the transport layer",
            ));
        }
        let envelope = Envelope::Invoke {
            urbjid: target.urbject.clone(),
            args_json: args_json.to_string(),
        };
        self.enqueue_inbound(&self.vat_id, &envelope.to_bytes()?)?;
        Ok(())
    }

    /// Queues an `execute` message against a memory on this vat.
    pub fn send_execute(&self, memid: &MemoryId, code: &str, args_json: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(args_json)?;
        let envelope = Envelope::Execute {
            memid: memid.clone(),
            code: code.to_string(),
            args_json: args_json.to_string(),
        };
        self.enqueue_inbound(&self.vat_id, &envelope.to_bytes()?)?;
        Ok(())
    }
}
