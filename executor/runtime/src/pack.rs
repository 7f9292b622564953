//! Pack / Unpack
//!
//! The confinement boundary. Outer storage represents authorities as tagged
//! dicts `{"__power__": kind, "swissnum": s}` inside otherwise ordinary JSON;
//! inner (guest-visible) values carry the corresponding host objects instead.
//! This module translates between the two, in three modes that differ only in
//! which tags they permit:
//!
//! | entry  | references | memory           | native |
//! |--------|------------|------------------|--------|
//! | power  | yes        | one, top-level   | yes    |
//! | memory | yes        | no               | no     |
//! | args   | yes        | no               | no     |
//!
//! Packing defends against tag forgery twice over: guest mappings containing
//! the literal `__power__` key are rejected outright, and the tags the
//! encoder itself emits use a one-time nonce key that is only substituted
//! back to `__power__` after the JSON text is fully rendered.

use rand::RngCore;
use serde_json::{json, Map as JsonMap, Value as Json};
use vatrun_id_types::{MemoryId, RefId};
use vatrun_kv_store::Db;

use crate::error::{ErrorKind, Result};
use crate::turn::Turn;
use crate::value::Value;

/// The reserved tag key.
pub const POWER_KEY: &str = "__power__";

/// Nesting bound for serialized data. Guest data is shared-mutable, so a
/// cyclic structure is expressible; the bound turns it into a fault instead
/// of unbounded recursion.
const MAX_DEPTH: u32 = 128;

// --- packing

struct Packing {
    allow_native: bool,
    nonce: String,
}

impl Packing {
    fn new(allow_native: bool) -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Packing {
            allow_native,
            nonce: format!("__power_{}__", hex::encode(raw)),
        }
    }

    /// A tagged dict, emitted under the nonce key.
    fn tag(&self, kind: &str, swissnum: Json) -> Json {
        let mut obj = JsonMap::new();
        obj.insert(self.nonce.clone(), Json::String(kind.to_string()));
        obj.insert("swissnum".to_string(), swissnum);
        Json::Object(obj)
    }

    fn pack_value(&self, value: &Value, depth: u32) -> Result<Json> {
        if depth > MAX_DEPTH {
            return Err(ErrorKind::Msg("serialized data is nested too deeply".to_string()).into());
        }
        match value {
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(json!(b)),
            Value::Int(i) => Ok(json!(i)),
            Value::Float(f) => Ok(json!(f)),
            Value::Str(s) => Ok(json!(s)),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.borrow().len());
                for item in items.borrow().iter() {
                    out.push(self.pack_value(item, depth + 1)?);
                }
                Ok(Json::Array(out))
            }
            Value::Map(entries) => {
                let entries = entries.borrow();
                if entries.contains_key(POWER_KEY) {
                    return Err(ErrorKind::ForbiddenPowerKey.into());
                }
                let mut obj = JsonMap::new();
                for (k, v) in entries.iter() {
                    obj.insert(k.clone(), self.pack_value(v, depth + 1)?);
                }
                Ok(Json::Object(obj))
            }
            Value::Reference(refid) => {
                let swissnum = serde_json::to_value(refid.as_ref())?;
                Ok(self.tag("reference", swissnum))
            }
            Value::Native(name) => {
                if !self.allow_native {
                    return Err(ErrorKind::NativeNotSerializable.into());
                }
                Ok(self.tag("native", json!(name.as_str())))
            }
        }
    }

    /// Renders the tree and substitutes the nonce key with `__power__`.
    fn finish(&self, tree: &Json) -> Result<String> {
        let text = serde_json::to_string(tree)?;
        Ok(text.replace(&self.nonce, POWER_KEY))
    }
}

/// Packs a child power. Only here is the top-level `"memory"` slot special:
/// it is replaced by a memory tag via [`Turn::put_memory`], which either
/// reuses the memid of an already-opened memory (sharing) or mints a fresh
/// one with the mapping as its initial contents.
pub fn pack_power<S: Db>(turn: &mut Turn<'_, S>, child_power: &Value) -> Result<String> {
    let packing = Packing::new(true);
    let tree = match child_power {
        Value::Map(cell) => {
            let entries = cell.borrow();
            if entries.contains_key(POWER_KEY) {
                return Err(ErrorKind::ForbiddenPowerKey.into());
            }
            let mut obj = JsonMap::new();
            for (k, v) in entries.iter() {
                let packed = if k == "memory" {
                    // a power may deny storage by carrying no memory at all
                    if matches!(v, Value::Null) {
                        continue;
                    }
                    let memid = turn.put_memory(v)?;
                    packing.tag("memory", json!(memid.as_str()))
                } else {
                    packing.pack_value(v, 1)?
                };
                obj.insert(k.clone(), packed);
            }
            Json::Object(obj)
        }
        other => packing.pack_value(other, 0)?,
    };
    packing.finish(&tree)
}

/// Packs memory contents. Memory tags and natives are not representable here;
/// a mapping that happens to be an opened memory serializes by value.
pub fn pack_memory(value: &Value) -> Result<String> {
    let packing = Packing::new(false);
    let tree = packing.pack_value(value, 0)?;
    packing.finish(&tree)
}

/// Packs message arguments. Same rules as memory contents.
pub fn pack_args(value: &Value) -> Result<String> {
    let packing = Packing::new(false);
    let tree = packing.pack_value(value, 0)?;
    packing.finish(&tree)
}

// --- unpacking

struct Unpacking {
    allow_native: bool,
    allow_memory: bool,
}

impl Unpacking {
    fn unpack_value<S: Db>(&mut self, turn: &mut Turn<'_, S>, json: &Json) -> Result<Value> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Int(i)),
                None => Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Json::String(s) => Ok(Value::Str(s.clone())),
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.unpack_value(turn, item)?);
                }
                Ok(Value::list_from(out))
            }
            Json::Object(entries) => {
                let kind = match entries.get(POWER_KEY) {
                    Some(kind) => kind
                        .as_str()
                        .ok_or(ErrorKind::MalformedTag("tag kind must be a string"))?,
                    None => {
                        // a plain object
                        let mut map = std::collections::BTreeMap::new();
                        for (k, v) in entries {
                            map.insert(k.clone(), self.unpack_value(turn, v)?);
                        }
                        return Ok(Value::map_from(map));
                    }
                };
                let swissnum = entries
                    .get("swissnum")
                    .ok_or(ErrorKind::MalformedTag("tag is missing its swissnum"))?;
                match kind {
                    "native" if self.allow_native => {
                        let name = swissnum
                            .as_str()
                            .ok_or(ErrorKind::MalformedTag("native swissnum must be a name"))?;
                        turn.get_native_power(name)
                    }
                    "memory" => {
                        if !self.allow_memory {
                            return Err(ErrorKind::SecondMemory.into());
                        }
                        self.allow_memory = false;
                        let memid = swissnum
                            .as_str()
                            .and_then(|s| MemoryId::parse_str(s).ok())
                            .ok_or(ErrorKind::MalformedTag("memory swissnum must be a memid"))?;
                        turn.get_memory(&memid)
                    }
                    "reference" => {
                        let refid: RefId = serde_json::from_value(swissnum.clone()).map_err(
                            |_| ErrorKind::MalformedTag("reference swissnum must be [vatid, urbjid]"),
                        )?;
                        Ok(turn.get_reference(refid))
                    }
                    other => Err(ErrorKind::UnknownPowerKind(other.to_string()).into()),
                }
            }
        }
    }

    fn unpack<S: Db>(&mut self, turn: &mut Turn<'_, S>, json_str: &str) -> Result<Value> {
        let json: Json = serde_json::from_str(json_str)?;
        self.unpack_value(turn, &json)
    }
}

/// Unpacks a stored power document into the guest-visible power value.
pub fn unpack_power<S: Db>(turn: &mut Turn<'_, S>, power_json: &str) -> Result<Value> {
    Unpacking {
        allow_native: true,
        allow_memory: true,
    }
    .unpack(turn, power_json)
}

/// Unpacks stored memory contents.
pub fn unpack_memory<S: Db>(turn: &mut Turn<'_, S>, data_json: &str) -> Result<Value> {
    Unpacking {
        allow_native: false,
        allow_memory: false,
    }
    .unpack(turn, data_json)
}

/// Unpacks inbound message arguments.
pub fn unpack_args<S: Db>(turn: &mut Turn<'_, S>, args_json: &str) -> Result<Value> {
    Unpacking {
        allow_native: false,
        allow_memory: false,
    }
    .unpack(turn, args_json)
}

/// Builds the stored power document for the administrative paths: an optional
/// memory grant plus optionally the `make_urbject` native. This is host-side
/// construction of trusted tags, not packing of guest data.
pub fn power_document(memid: Option<&MemoryId>, grant_make_urbject: bool) -> String {
    let mut obj = JsonMap::new();
    if let Some(memid) = memid {
        obj.insert(
            "memory".to_string(),
            json!({(POWER_KEY): "memory", "swissnum": memid.as_str()}),
        );
    }
    if grant_make_urbject {
        obj.insert(
            "make_urbject".to_string(),
            json!({(POWER_KEY): "native", "swissnum": "make_urbject"}),
        );
    }
    Json::Object(obj).to_string()
}
