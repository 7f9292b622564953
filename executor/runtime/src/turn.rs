//! Turn state
//!
//! A [`Turn`] holds all the state for a single message delivery: the memo
//! tables that keep in-memory object identity coherent with on-disk
//! swissnums, the entities created while the guest ran, and the outbound
//! messages it produced. Nothing touches storage until [`Turn::commit`],
//! which applies everything under one write transaction - a turn either
//! commits completely or has no observable effect beyond log lines.
//!
//! The memo tables are what make nested synchronous calls coherent: a
//! sub-invocation asking for the same memid gets the *same* mapping as its
//! caller, so writes are mutually visible, and the same refid always yields
//! the same reference value, so identity comparisons and pack lookups work.

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, info};
use vatrun_id_types::{MemoryId, PowerId, RefId, UrbjectId, VatId};
use vatrun_kv_store::prelude::*;

use crate::db::store::{self, UrbjectRecord};
use crate::db::queue;
use crate::error::{ErrorKind, Result};
use crate::pack;
use crate::script::{self, Host, Interp};
use crate::value::{MapIdent, NativeName, Value};
use crate::vat::Envelope;
use crate::{MEMORY_SUB_DB, POWER_SUB_DB, QUEUE_SUB_DB, URBJECT_SUB_DB};

/// Bound on nested synchronous calls within one turn.
const MAX_INVOKE_DEPTH: u32 = 32;

/// All the state for a single turn of the vat.
pub struct Turn<'a, S: Db> {
    vat_id: VatId,
    db: &'a S,

    /// Outbound messages in guest append order, delivered at commit.
    outbound: Vec<(VatId, Vec<u8>)>,

    /// powid -> the exact unpacked inner power. Retaining the value keeps
    /// its mapping alive, so the ident below cannot be re-assigned.
    powers: HashMap<PowerId, Value>,
    /// mapping identity -> powid, for powid reuse in `make_urbject`.
    power_idents: HashMap<MapIdent, PowerId>,

    /// memid -> the live mapping shared by every holder within this turn.
    memories: HashMap<MemoryId, Value>,
    /// mapping identity -> memid, consulted by pack to detect sharing.
    memory_idents: HashMap<MapIdent, MemoryId>,

    /// refid -> the canonical reference value for this turn.
    references: HashMap<RefId, Value>,

    /// Entities minted during this turn, written out at commit.
    created_urbjects: Vec<(UrbjectId, UrbjectRecord)>,
    created_powers: HashMap<PowerId, String>,
    created_memories: HashMap<MemoryId, String>,

    call_depth: u32,
    debug_sink: Option<Box<dyn FnMut(Value) + 'a>>,
}

impl<'a, S: Db> Turn<'a, S> {
    pub fn new(vat_id: VatId, db: &'a S) -> Self {
        Turn {
            vat_id,
            db,
            outbound: Vec::new(),
            powers: HashMap::new(),
            power_idents: HashMap::new(),
            memories: HashMap::new(),
            memory_idents: HashMap::new(),
            references: HashMap::new(),
            created_urbjects: Vec::new(),
            created_powers: HashMap::new(),
            created_memories: HashMap::new(),
            call_depth: 0,
            debug_sink: None,
        }
    }

    /// Installs the guest's `debug(x)` hook.
    pub fn set_debug(&mut self, sink: Box<dyn FnMut(Value) + 'a>) {
        self.debug_sink = Some(sink);
    }

    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    // --- memo tables (idempotent, allocate only for genuinely new identities)

    /// Resolves a powid to its inner power, unpacking it once per turn.
    pub fn get_power(&mut self, powid: &PowerId) -> Result<Value> {
        if let Some(power) = self.powers.get(powid) {
            return Ok(power.clone());
        }
        let power_json = match self.created_powers.get(powid) {
            Some(json) => json.clone(),
            None => store::read_power(self.db, powid)?.ok_or_else(|| ErrorKind::MissingPower {
                powid: powid.clone(),
            })?,
        };
        let inner = pack::unpack_power(self, &power_json)?;
        self.powers.insert(powid.clone(), inner.clone());
        if let Some(ident) = inner.ident() {
            self.power_idents.insert(ident, powid.clone());
        }
        Ok(inner)
    }

    /// Resolves a memid to the live mapping, opening it lazily. Every caller
    /// within the turn gets the same mapping.
    pub fn get_memory(&mut self, memid: &MemoryId) -> Result<Value> {
        if let Some(data) = self.memories.get(memid) {
            return Ok(data.clone());
        }
        let data_json = match self.created_memories.get(memid) {
            Some(json) => json.clone(),
            None => store::read_memory(self.db, memid)?.ok_or_else(|| {
                ErrorKind::MissingMemory {
                    memid: memid.clone(),
                }
            })?,
        };
        let data = pack::unpack_memory(self, &data_json)?;
        self.memories.insert(memid.clone(), data.clone());
        if let Some(ident) = data.ident() {
            self.memory_idents.insert(ident, memid.clone());
        }
        Ok(data)
    }

    /// Returns the canonical reference for a refid.
    pub fn get_reference(&mut self, refid: RefId) -> Value {
        self.references
            .entry(refid.clone())
            .or_insert_with(|| Value::Reference(Rc::new(refid)))
            .clone()
    }

    /// Resolves a native tag to the capability it names.
    pub fn get_native_power(&mut self, name: &str) -> Result<Value> {
        NativeName::from_name(name)
            .map(Value::Native)
            .ok_or_else(|| ErrorKind::UnknownNativePower(name.to_string()).into())
    }

    /// Returns the memid backing a mapping, minting a fresh memory when the
    /// mapping is not one the turn handed out.
    ///
    /// Passing the same raw mapping to two independent `make_urbject` calls
    /// does not give them shared memory - only a mapping that arrived through
    /// some power's `memory` slot is identity-known and reused.
    pub fn put_memory(&mut self, data: &Value) -> Result<MemoryId> {
        if let Some(ident) = data.ident() {
            if let Some(memid) = self.memory_idents.get(&ident) {
                return Ok(memid.clone());
            }
        }
        let packed = pack::pack_memory(data)?;
        let memid = MemoryId::generate();
        self.created_memories.insert(memid.clone(), packed);
        Ok(memid)
    }

    // --- guest-reachable operations

    /// The `make_urbject(code, power)` native.
    pub fn make_urbject(&mut self, code: String, child_power: &Value) -> Result<Value> {
        let existing = child_power
            .ident()
            .and_then(|ident| self.power_idents.get(&ident).cloned());
        let powid = match existing {
            // reuse the existing powid instead of creating a new one
            Some(powid) => powid,
            None => {
                let packed = pack::pack_power(self, child_power)?;
                let powid = PowerId::generate();
                self.created_powers.insert(powid.clone(), packed);
                powid
            }
        };
        let urbjid = UrbjectId::generate();
        debug!("make_urbject: {urbjid} bound to {powid}");
        self.created_urbjects
            .push((urbjid.clone(), UrbjectRecord { powid, code }));
        Ok(self.get_reference(RefId::new(self.vat_id.clone(), urbjid)))
    }

    /// Synchronous call of another urbject on this vat, on the same turn.
    ///
    /// `args` crosses as a host value - it is not re-serialized, so shared
    /// mappings stay shared between caller and callee.
    pub fn local_sync_call(&mut self, target: &RefId, args: Value) -> Result<Value> {
        if target.vat != self.vat_id {
            return Err(ErrorKind::CrossVatCall {
                target: target.clone(),
            }
            .into());
        }
        if self.call_depth >= MAX_INVOKE_DEPTH {
            return Err(crate::Error::msg("invocation stack too deep"));
        }
        let record = self.load_urbject(&target.urbject)?;
        self.call_depth += 1;
        let result = Invocation::new(record.code, record.powid).execute(self, args);
        self.call_depth -= 1;
        result
    }

    /// Asynchronous send: packs the args now, queues the envelope for
    /// delivery at commit. No result is ever delivered back.
    pub fn outbound_message(&mut self, target: &RefId, args: &Value) -> Result<()> {
        let args_json = pack::pack_args(args)?;
        let envelope = Envelope::Invoke {
            urbjid: target.urbject.clone(),
            args_json,
        };
        self.outbound
            .push((target.vat.clone(), envelope.to_bytes()?));
        Ok(())
    }

    /// Buffers an ad-hoc power document: an optional memory plus the
    /// `make_urbject` grant. Used by the `execute` command.
    pub fn create_power_for_memid(
        &mut self,
        memid: Option<&MemoryId>,
        grant_make_urbject: bool,
    ) -> PowerId {
        let powid = PowerId::generate();
        self.created_powers
            .insert(powid.clone(), pack::power_document(memid, grant_make_urbject));
        powid
    }

    fn load_urbject(&self, urbjid: &UrbjectId) -> Result<UrbjectRecord> {
        if let Some((_, record)) = self
            .created_urbjects
            .iter()
            .find(|(id, _)| id == urbjid)
        {
            return Ok(record.clone());
        }
        store::read_urbject(self.db, urbjid)?.ok_or_else(|| {
            ErrorKind::MissingUrbject {
                urbjid: urbjid.clone(),
            }
            .into()
        })
    }

    // --- the entry point

    /// Runs one turn to completion: unpack the args, execute the top-level
    /// invocation, commit. Any error on the way out leaves storage untouched
    /// and the inbound message unacknowledged.
    pub fn start_turn(
        mut self,
        code: &str,
        powid: &PowerId,
        args_json: &str,
        from: &VatId,
    ) -> Result<Value> {
        debug!("turn start on {} (message from {from})", self.vat_id);
        let args = pack::unpack_args(&mut self, args_json)?;
        let invocation = Invocation::new(code.to_string(), powid.clone());
        let rc = invocation.execute(&mut self, args)?;
        self.commit()?;
        Ok(rc)
    }

    /// End-of-turn atomic apply: memory writebacks, minted entities and
    /// outbound messages, all under one storage transaction.
    fn commit(self) -> Result<()> {
        // Pack the opened memories first; a confinement fault in the new
        // contents aborts the turn before anything is written.
        let mut memory_writes = Vec::with_capacity(self.memories.len());
        for (memid, data) in &self.memories {
            memory_writes.push((memid.clone(), pack::pack_memory(data)?));
        }

        let urbject_ptr = self.db.open_sub_db(URBJECT_SUB_DB)?;
        let power_ptr = self.db.open_sub_db(POWER_SUB_DB)?;
        let memory_ptr = self.db.open_sub_db(MEMORY_SUB_DB)?;
        let queue_ptr = self.db.open_sub_db(QUEUE_SUB_DB)?;

        let mut txn = self.db.begin_rw_txn()?;
        for (powid, power_json) in &self.created_powers {
            store::write_power::<S>(&power_ptr, &mut txn, powid, power_json)?;
        }
        for (urbjid, record) in &self.created_urbjects {
            store::write_urbject::<S>(&urbject_ptr, &mut txn, urbjid, record)?;
        }
        for (memid, initial_json) in &self.created_memories {
            // an opened memory is covered by its writeback below
            if !self.memories.contains_key(memid) {
                store::write_memory::<S>(&memory_ptr, &mut txn, memid, initial_json)?;
            }
        }
        for (memid, data_json) in &memory_writes {
            store::write_memory::<S>(&memory_ptr, &mut txn, memid, data_json)?;
        }
        for (peer, payload) in &self.outbound {
            queue::enqueue_outbound::<S>(&queue_ptr, &mut txn, peer, payload)?;
        }
        txn.commit()?;

        debug!(
            "turn committed: {} urbjects, {} powers, {} memories, {} messages",
            self.created_urbjects.len(),
            self.created_powers.len(),
            memory_writes.len(),
            self.outbound.len()
        );
        Ok(())
    }
}

/// The effects guest code can reach, wired to the turn.
impl<'a, S: Db> Host for Turn<'a, S> {
    fn log(&mut self, msg: &str) {
        // log lines are the only effect of a turn that survives an abort
        info!("[{}] {msg}", self.vat_id);
    }

    fn debug(&mut self, value: Value) {
        if let Some(sink) = &mut self.debug_sink {
            sink(value);
        }
    }

    fn send(&mut self, target: &RefId, args: Value) -> Result<Value> {
        self.outbound_message(target, &args)?;
        Ok(Value::Null)
    }

    fn call(&mut self, target: &RefId, args: Value) -> Result<Value> {
        self.local_sync_call(target, args)
    }

    fn native(&mut self, native: NativeName, args: Vec<Value>) -> Result<Value> {
        match native {
            NativeName::MakeUrbject => {
                let [code, child_power]: [Value; 2] = args.try_into().map_err(|_| {
                    crate::Error::msg("make_urbject(code, power) takes two arguments")
                })?;
                let code = match code {
                    Value::Str(code) => code,
                    other => {
                        return Err(crate::Error::msg(format!(
                            "make_urbject code must be a string, got {}",
                            other.type_name()
                        )))
                    }
                };
                self.make_urbject(code, &child_power)
            }
        }
    }
}

/// One stack frame: a `(code, powid)` pair about to run `call(args, power)`.
pub struct Invocation {
    code: String,
    powid: PowerId,
}

impl Invocation {
    pub fn new(code: String, powid: PowerId) -> Self {
        Invocation { code, powid }
    }

    /// Resolves the frame's power, compiles the code and runs the guest's
    /// `call` function. The return value is only used by synchronous calls.
    pub fn execute<S: Db>(&self, turn: &mut Turn<'_, S>, args: Value) -> Result<Value> {
        let inner_power = turn.get_power(&self.powid)?;
        let program = script::compile(&self.code)?;
        let mut interp = Interp::new(&program, turn);
        let rc = interp.call_function("call", vec![args, inner_power])?;
        Ok(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;
    use vatrun_kv_store::backend::lmdb::Lmdb;

    const F1: &str = "fn call(args, power) {\n    debug(\"I have power!\");\n}\n";
    const F2: &str =
        "fn call(args, power) {\n    power[\"memory\"][\"counter\"] = power[\"memory\"][\"counter\"] + args[\"delta\"];\n}\n";

    fn open_db() -> (Lmdb, tempfile::TempDir) {
        let tmp = tempdir().unwrap();
        let db = Lmdb::new(tmp.path(), crate::MAX_SUB_DBS).unwrap();
        for name in [
            crate::URBJECT_SUB_DB,
            crate::POWER_SUB_DB,
            crate::MEMORY_SUB_DB,
            crate::QUEUE_SUB_DB,
        ] {
            db.create_sub_db(name).unwrap();
        }
        (db, tmp)
    }

    fn seed_memory(db: &Lmdb, data_json: &str) -> MemoryId {
        let memid = MemoryId::generate();
        let ptr = db.open_sub_db(crate::MEMORY_SUB_DB).unwrap();
        let mut txn = db.begin_rw_txn().unwrap();
        store::write_memory::<Lmdb>(&ptr, &mut txn, &memid, data_json).unwrap();
        txn.commit().unwrap();
        memid
    }

    #[test]
    fn execute_reaches_the_debug_hook() {
        let (db, _tmp) = open_db();
        let vat_id = VatId::generate();
        let memid = seed_memory(&db, "{}");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut turn = Turn::new(vat_id.clone(), &db);
        turn.set_debug(Box::new(move |v| sink.borrow_mut().push(v)));
        let powid = turn.create_power_for_memid(Some(&memid), false);
        turn.start_turn(F1, &powid, "{}", &vat_id).unwrap();

        assert_eq!(&*seen.borrow(), &[Value::str("I have power!")]);
    }

    #[test]
    fn memory_writes_persist_at_commit() {
        let (db, _tmp) = open_db();
        let vat_id = VatId::generate();
        let memid = seed_memory(&db, r#"{"counter":0}"#);

        let mut turn = Turn::new(vat_id.clone(), &db);
        let powid = turn.create_power_for_memid(Some(&memid), false);
        turn.start_turn(F2, &powid, r#"{"delta": 2}"#, &vat_id).unwrap();

        let stored = store::read_memory(&db, &memid).unwrap().unwrap();
        let contents: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(contents, serde_json::json!({"counter": 2}));
    }

    #[test]
    fn guest_exception_commits_nothing() {
        let (db, _tmp) = open_db();
        let vat_id = VatId::generate();
        let memid = seed_memory(&db, r#"{"counter":0}"#);

        let code = "fn call(args, power) {\n    power[\"memory\"][\"counter\"] = 9;\n    boom();\n}\n";
        let mut turn = Turn::new(vat_id.clone(), &db);
        let powid = turn.create_power_for_memid(Some(&memid), false);
        let err = turn.start_turn(code, &powid, "{}", &vat_id).unwrap_err();
        assert!(err.to_string().contains("guest exception"), "got: {err}");

        let stored = store::read_memory(&db, &memid).unwrap().unwrap();
        assert_eq!(stored, r#"{"counter":0}"#);
    }

    #[test]
    fn rehanding_the_same_power_reuses_the_powid() {
        let (db, _tmp) = open_db();
        let vat_id = VatId::generate();
        let memid = seed_memory(&db, "{}");

        // the child is given the exact power mapping the parent received
        let code = "fn call(args, power) {\n    power[\"make_urbject\"](\"fn call(a, p) { return null; }\", power);\n}\n";
        let mut turn = Turn::new(vat_id.clone(), &db);
        let powid = turn.create_power_for_memid(Some(&memid), true);
        turn.start_turn(code, &powid, "{}", &vat_id).unwrap();

        let urbjects = store::list_urbjects(&db).unwrap();
        assert_eq!(urbjects.len(), 1);
        let record = store::read_urbject(&db, &urbjects[0]).unwrap().unwrap();
        assert_eq!(record.powid, powid, "child must share the parent's powid");
    }

    #[test]
    fn fresh_child_power_gets_its_own_powid() {
        let (db, _tmp) = open_db();
        let vat_id = VatId::generate();
        let memid = seed_memory(&db, "{}");

        let code = "fn call(args, power) {\n    power[\"make_urbject\"](\"fn call(a, p) { return null; }\", {\"note\": \"fresh\"});\n}\n";
        let mut turn = Turn::new(vat_id.clone(), &db);
        let powid = turn.create_power_for_memid(Some(&memid), true);
        turn.start_turn(code, &powid, "{}", &vat_id).unwrap();

        let urbjects = store::list_urbjects(&db).unwrap();
        assert_eq!(urbjects.len(), 1);
        let record = store::read_urbject(&db, &urbjects[0]).unwrap().unwrap();
        assert_ne!(record.powid, powid);
        let power_json = store::read_power(&db, &record.powid).unwrap().unwrap();
        let power: serde_json::Value = serde_json::from_str(&power_json).unwrap();
        assert_eq!(power, serde_json::json!({"note": "fresh"}));
    }

    #[test]
    fn references_are_canonical_per_turn() {
        let (db, _tmp) = open_db();
        let vat_id = VatId::generate();
        let mut turn = Turn::new(vat_id.clone(), &db);
        let refid = RefId::new(VatId::generate(), UrbjectId::generate());
        let a = turn.get_reference(refid.clone());
        let b = turn.get_reference(refid);
        match (a, b) {
            (Value::Reference(a), Value::Reference(b)) => assert!(Rc::ptr_eq(&a, &b)),
            _ => panic!("expected references"),
        }
    }
}
