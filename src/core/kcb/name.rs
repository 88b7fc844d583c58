//! Path-derived hash keys and path helpers
//!
//! A node's conversion key folds every character of its path components
//! (upper-cased, separators skipped) into the key of its parent:
//! `k = 37 * k + upcase(ch)`.

/// Multiplier applied before reducing a key to a bucket
const RNDM_CONSTANT: u32 = 314_159_269;

/// Prime modulus applied before reducing a key to a bucket
const RNDM_PRIME: u32 = 1_000_000_007;

/// Path separator
pub const SEPARATOR: char = '\\';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ConvKey(pub u32);

impl ConvKey {
    pub const ROOT: ConvKey = ConvKey(0);

    /// Fold one path component into this key
    pub fn extend(self, component: &str) -> ConvKey {
        let key = component
            .chars()
            .filter(|&ch| ch != SEPARATOR)
            .fold(self.0, |key, ch| {
                let upper = ch.to_uppercase().next().unwrap_or(ch);
                key.wrapping_mul(37).wrapping_add(upper as u32)
            });
        ConvKey(key)
    }

    /// Key of a full path
    pub fn of_path(path: &str) -> ConvKey {
        components(path).fold(ConvKey::ROOT, ConvKey::extend)
    }

    /// Hash bucket for a table of `table_size` buckets
    pub fn bucket_index(self, table_size: usize) -> usize {
        let scrambled = RNDM_CONSTANT.wrapping_mul(self.0) % RNDM_PRIME;
        scrambled as usize % table_size
    }
}

/// Non-empty components of a `\`-separated path
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|c| !c.is_empty())
}

/// Canonical form used for case-insensitive comparison: lower-cased,
/// leading separator, no trailing or doubled separators
pub fn canonical(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for component in components(path) {
        out.push(SEPARATOR);
        out.push_str(&component.to_lowercase());
    }
    out
}

/// Append a relative path (already lower-cased) to a canonical path
pub fn join(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}{}{}", base, SEPARATOR, relative)
    }
}

/// Whether a single component is a valid key name
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(SEPARATOR) && name.len() <= 255
}
