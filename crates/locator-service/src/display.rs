//! Presentation strings for resolved values.

use std::collections::BTreeMap;

/// Maps a raw value to a richer presentation string.
///
/// Implementations must be pure and cheap, they are called on every resolution.
pub trait DisplayMapping: Send + Sync + 'static {
    fn lookup(&self, value: &str) -> Option<String>;
}

/// A static table of presentation strings.
#[derive(Debug, Clone, Default)]
pub struct DisplayTable {
    names: BTreeMap<String, String>,
}

impl DisplayTable {
    pub fn new(names: BTreeMap<String, String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl DisplayMapping for DisplayTable {
    fn lookup(&self, value: &str) -> Option<String> {
        self.names.get(value).cloned()
    }
}

/// The string to present for `value`, falling back to the raw value.
pub fn display_for(mapping: &dyn DisplayMapping, value: Option<&str>) -> Option<String> {
    let value = value?;
    Some(mapping.lookup(value).unwrap_or_else(|| value.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falls_back_to_raw_value() {
        let table = DisplayTable::new(BTreeMap::from([("FR".into(), "France".into())]));

        assert_eq!(display_for(&table, Some("FR")).as_deref(), Some("France"));
        assert_eq!(display_for(&table, Some("PE")).as_deref(), Some("PE"));
        assert_eq!(display_for(&table, None), None);
    }
}
