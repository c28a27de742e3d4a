use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringHash(pub u32);

impl StringHash {
    pub fn of(text: &str) -> Self {
        let hash = fnv1a_32(text.as_bytes());
        // Read lock first: hot-path hashing only contends on the write lock
        // while a debug table is installed.
        if DEBUG_NAMES.read().is_some() {
            if let Some(table) = DEBUG_NAMES.write().as_mut() {
                table.entry(hash).or_insert_with(|| text.to_string());
            }
        }
        StringHash(hash)
    }

    pub const fn from_raw(value: u32) -> Self {
        StringHash(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StringHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = DEBUG_NAMES.read().as_ref() {
            if let Some(name) = table.get(&self.0) {
                return f.write_str(name);
            }
        }
        write!(f, "{:08x}", self.0)
    }
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

static DEBUG_NAMES: RwLock<Option<HashMap<u32, String>>> = RwLock::new(None);

pub fn install_debug_names() {
    let mut table = DEBUG_NAMES.write();
    if table.is_none() {
        *table = Some(HashMap::new());
    }
}

pub fn teardown_debug_names() {
    *DEBUG_NAMES.write() = None;
}

pub fn debug_names_installed() -> bool {
    DEBUG_NAMES.read().is_some()
}

pub fn lookup_debug_name(hash: StringHash) -> Option<String> {
    DEBUG_NAMES.read().as_ref().and_then(|table| table.get(&hash.0).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let a = StringHash::of("spine_01");
        let b = StringHash::of("spine_01");
        assert_eq!(a, b);
        assert_eq!(a.value(), fnv1a_32(b"spine_01"));
    }

    #[test]
    fn empty_string_hashes_to_offset_basis() {
        assert_eq!(StringHash::of("").value(), FNV_OFFSET);
    }

    #[test]
    fn distinct_paths_produce_distinct_hashes() {
        let left = StringHash::of("arm_l/hand_l");
        let right = StringHash::of("arm_r/hand_r");
        assert_ne!(left, right);
    }

    #[test]
    fn display_falls_back_to_hex_for_unregistered_hashes() {
        let hash = StringHash::from_raw(0x00ab_cdef);
        assert_eq!(format!("{hash}"), "00abcdef");
    }

    #[test]
    fn debug_table_round_trips_names() {
        // Hashing with no table installed registers nothing.
        let uninstalled = StringHash::of("clavicle");
        install_debug_names();
        assert!(lookup_debug_name(uninstalled).is_none());

        let hash = StringHash::of("pelvis");
        assert_eq!(lookup_debug_name(hash).as_deref(), Some("pelvis"));
        assert_eq!(format!("{hash}"), "pelvis");
        teardown_debug_names();
        assert!(lookup_debug_name(hash).is_none());
    }
}
