//! 64-bit unique identifiers and the registry that detects collisions between them.

use std::collections::HashMap;
use std::fmt;
use std::io;

use parking_lot::Mutex;

/// Identifies a protocol independently of its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolUniqueId(pub u64);

/// Identifies a wire type independently of its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeUniqueId(pub u64);

/// Declaration order of a method within its protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position(pub u64);

macro_rules! unique_id_impls {
    ($ty:ty) => {
        impl $ty {
            pub fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            /// Writes the id as eight big-endian bytes.
            pub fn encode<W: io::Write>(self, mut w: W) -> io::Result<()> {
                w.write_all(&self.to_be_bytes())
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

unique_id_impls!(ProtocolUniqueId);
unique_id_impls!(TypeUniqueId);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unique id {id:#018x} is registered to {existing:?}, cannot register {name:?}")]
pub struct UniqueIdCollision {
    pub id: u64,
    pub existing: String,
    pub name: String,
}

/// Tracks which name owns each unique id.
///
/// Created once by the process and passed to whatever needs collision checking.
#[derive(Debug, Default)]
pub struct UniqueIdRegistry {
    ids: Mutex<HashMap<u64, String>>,
}

impl UniqueIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id` for `name`. Re-registering the same pair is a no-op.
    pub fn register(&self, name: &str, id: u64) -> Result<(), UniqueIdCollision> {
        let mut ids = self.ids.lock();
        match ids.get(&id) {
            Some(existing) if existing == name => Ok(()),
            Some(existing) => Err(UniqueIdCollision {
                id,
                existing: existing.clone(),
                name: name.to_string(),
            }),
            None => {
                ids.insert(id, name.to_string());
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
