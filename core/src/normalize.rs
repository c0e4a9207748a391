//! Address and UUID normalization
//!
//! BLE addresses and UUIDs arrive in many spellings: `C0:AB:2A:6A:1A:89`,
//! `c0ab2a6a1a89`, `180F`, `0000180f-0000-1000-8000-00805f9b34fb`. Every
//! comparison in the gateway goes through [`normalize`] so that separators
//! and case never decide equality.
//!
//! Colons are reserved in URLs, so web clients usually pass addresses without
//! them.

/// Strip `-` and `:` separators and lowercase the remainder.
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '-' && *c != ':')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Compare two addresses or UUIDs after normalization.
pub fn equal(a: &str, b: &str) -> bool {
    let mut left = a.chars().filter(|c| *c != '-' && *c != ':').flat_map(char::to_lowercase);
    let mut right = b.chars().filter(|c| *c != '-' && *c != ':').flat_map(char::to_lowercase);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return true,
            (Some(l), Some(r)) if l == r => continue,
            _ => return false,
        }
    }
}
