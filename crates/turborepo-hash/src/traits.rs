use serde::Serialize;

use crate::hash_object;

/// Types whose canonical serialization is their hash input.
///
/// Implemented by the hashable structs assembled during a run (task inputs,
/// global inputs, file hash maps). The blanket implementation means a type
/// only has to guarantee that its `Serialize` output is deterministic, which
/// in practice means keeping paths in unix form and collections either sorted
/// or map-shaped.
pub trait TurboHash {
    fn hash(&self) -> String;
}

impl<T> TurboHash for T
where
    T: Serialize,
{
    fn hash(&self) -> String {
        hash_object(self).expect("hashable values serialize to JSON")
    }
}
