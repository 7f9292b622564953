//! Inner values
//!
//! This module defines the value universe that guest code sees: ordinary JSON
//! data plus the two opaque host objects - references to urbjects and native
//! powers. Mappings and lists are shared mutable cells, so every holder of the
//! same mapping observes writes immediately; this is what lets a synchronous
//! sub-call mutate its caller's memory in place.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use vatrun_id_types::RefId;

/// A shared mutable mapping.
pub type MapCell = Rc<RefCell<BTreeMap<String, Value>>>;

/// A shared mutable list.
pub type ListCell = Rc<RefCell<Vec<Value>>>;

/// A guest-visible value.
///
/// `Reference` and `Native` are only ever constructed by the host side
/// (unpack, the turn's reference table, `make_urbject`). Guest code can pass
/// them around, compare them and invoke them, but it cannot mint one from
/// data - that is the confinement property.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(ListCell),
    Map(MapCell),
    /// An urbject reference, exposing `send` and `call` to the guest.
    Reference(Rc<RefId>),
    /// A callable host capability.
    Native(NativeName),
}

/// The set of native powers a vat knows how to hand out.
///
/// Every native is a named, swissnum-addressable capability, so a stored
/// power document granting one can be audited from its JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeName {
    MakeUrbject,
}

impl NativeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeName::MakeUrbject => "make_urbject",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "make_urbject" => Some(NativeName::MakeUrbject),
            _ => None,
        }
    }
}

impl fmt::Display for NativeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a shared mapping within one turn.
///
/// Two `Value::Map`s are the *same* mapping exactly when their idents are
/// equal. The turn keeps the mappings it has handed out alive in its tables,
/// so an ident can never be re-assigned to a different mapping mid-turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapIdent(*const RefCell<BTreeMap<String, Value>>);

impl Value {
    /// Creates a fresh empty mapping.
    pub fn new_map() -> Value {
        Value::Map(Rc::new(RefCell::new(BTreeMap::new())))
    }

    pub fn map_from(entries: BTreeMap<String, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn list_from(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Returns the mapping identity, if this value is a mapping.
    pub fn ident(&self) -> Option<MapIdent> {
        match self {
            Value::Map(cell) => Some(MapIdent(Rc::as_ptr(cell))),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Reference(_) => "reference",
            Value::Native(_) => "native",
        }
    }

    /// Converts a tag-free JSON tree into a value.
    ///
    /// This is a plain data conversion - it does not recognize power tags.
    /// Capability-bearing documents go through unpack instead.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::list_from(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::map_from(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Structural equality.
///
/// Mappings and lists compare by content, references by refid, natives by
/// name. Identity (sharing) is deliberately *not* part of equality - that is
/// what [`Value::ident`] is for.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                *a.borrow() == *b.borrow()
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                *a.borrow() == *b.borrow()
            }
            (Value::Reference(a), Value::Reference(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// JSON-flavored rendering for log lines and error messages.
    ///
    /// Rendering is depth-capped so a cyclic structure cannot hang a log
    /// statement; serialization proper rejects such structures.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(self, f, 0)
    }
}

const MAX_RENDER_DEPTH: u32 = 16;

fn render(value: &Value, f: &mut fmt::Formatter<'_>, depth: u32) -> fmt::Result {
    if depth > MAX_RENDER_DEPTH {
        return write!(f, "...");
    }
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Int(i) => write!(f, "{i}"),
        Value::Float(x) => write!(f, "{x}"),
        Value::Str(s) => write!(f, "{s:?}"),
        Value::List(items) => {
            write!(f, "[")?;
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                render(item, f, depth + 1)?;
            }
            write!(f, "]")
        }
        Value::Map(entries) => {
            write!(f, "{{")?;
            for (i, (k, v)) in entries.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k:?}: ")?;
                render(v, f, depth + 1)?;
            }
            write!(f, "}}")
        }
        Value::Reference(refid) => write!(f, "<reference {refid}>"),
        Value::Native(name) => write!(f, "<native {name}>"),
    }
}

/// Shallow-merges two mappings into a fresh one.
///
/// Entries of `a` keep their identity in the result (the cells are shared,
/// not copied), so `add(power, {...})["memory"]` is still the same mapping as
/// `power["memory"]`. Entries of `b` win on key collisions.
pub fn add(a: &Value, b: &Value) -> Option<Value> {
    let (a, b) = match (a, b) {
        (Value::Map(a), Value::Map(b)) => (a, b),
        _ => return None,
    };
    let mut merged = a.borrow().clone();
    for (k, v) in b.borrow().iter() {
        merged.insert(k.clone(), v.clone());
    }
    Some(Value::map_from(merged))
}
