use thiserror::Error;
use vatrun_id_types::{MemoryId, PowerId, RefId, UrbjectId};

use crate::script::ScriptError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn msg(msg: impl AsRef<str>) -> Self {
        ErrorKind::Msg(msg.as_ref().to_string()).into()
    }

    /// Returns `true` if this error is a confinement fault: guest data tried
    /// to name, forge or widen an authority it was not handed.
    pub fn is_confinement_fault(&self) -> bool {
        matches!(
            &self.kind,
            ErrorKind::ForbiddenPowerKey
                | ErrorKind::UnknownPowerKind(_)
                | ErrorKind::SecondMemory
                | ErrorKind::NativeNotSerializable
                | ErrorKind::MalformedTag(_)
                | ErrorKind::UnknownNativePower(_)
        )
    }

    /// Returns `true` if this error is a missing-entity fault: an
    /// urbjid/powid/memid did not resolve during unpack or invoke.
    pub fn is_missing_entity(&self) -> bool {
        matches!(
            &self.kind,
            ErrorKind::MissingUrbject { .. }
                | ErrorKind::MissingPower { .. }
                | ErrorKind::MissingMemory { .. }
        )
    }

}

impl From<ErrorKind> for Error {
    fn from(value: ErrorKind) -> Self {
        Error { kind: value }
    }
}

impl From<vatrun_kv_store::Error> for Error {
    fn from(value: vatrun_kv_store::Error) -> Self {
        ErrorKind::from(value).into()
    }
}

impl From<postcard::Error> for Error {
    fn from(value: postcard::Error) -> Self {
        ErrorKind::from(value).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        ErrorKind::from(value).into()
    }
}

impl From<ScriptError> for Error {
    fn from(value: ScriptError) -> Self {
        // a host error that bubbled through the interpreter keeps its own kind
        match value {
            ScriptError::Host(inner) => *inner,
            other => ErrorKind::Guest(other).into(),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ErrorKind {
    // --- High-level errors
    /// Storage errors
    #[error("storage error - {0}")]
    Db(#[from] vatrun_kv_store::Error),

    /// Binary-Encoding (postcard) related errors
    #[error("encoding error (binary) - {0}")]
    BinaryEncoding(#[from] postcard::Error),

    /// Json-Encoding related errors
    #[error("encoding error (json) - {0}")]
    JsonEncoding(#[from] serde_json::Error),

    // --- Confinement faults
    /// Guest data contains the reserved tag key
    #[error("forbidden __power__ in serializing data")]
    ForbiddenPowerKey,

    /// Tagged dict with a kind outside the allowed set for the current mode
    #[error("unknown power type '{0}'")]
    UnknownPowerKind(String),

    /// More than one memory tag in a single unpack
    #[error("only one Memory per Power")]
    SecondMemory,

    /// A native power reached pack outside of Power mode
    #[error("a NativePower cannot be serialized here")]
    NativeNotSerializable,

    /// Tagged dict whose swissnum field does not have the expected shape
    #[error("malformed power tag - {0}")]
    MalformedTag(&'static str),

    /// Native tag naming a power outside the known-natives set
    #[error("unknown native power '{0}'")]
    UnknownNativePower(String),

    // --- Missing entities
    #[error("no urbject {urbjid}")]
    MissingUrbject { urbjid: UrbjectId },

    #[error("no power {powid}")]
    MissingPower { powid: PowerId },

    #[error("no memory {memid}")]
    MissingMemory { memid: MemoryId },

    // --- Turn errors
    /// Compile failure or exception raised by the guest
    #[error("guest exception - {0}")]
    Guest(ScriptError),

    /// `call` only works against urbjects on the local vat
    #[error("synchronous call to remote urbject {target}")]
    CrossVatCall { target: RefId },

    /// The node configuration row is missing - the vat was never created
    #[error("node is not initialized - missing node config")]
    MissingNodeConfig,

    /// Generic error message - useful for communicating more complicated errors
    #[error("{0}")]
    Msg(String),
}
