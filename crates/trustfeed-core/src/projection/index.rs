/// One secondary index entry: the indexed value plus a disambiguator that
/// orders entries sharing the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub value: String,
    pub disambiguator: String,
}

impl IndexEntry {
    pub fn new(value: impl Into<String>, disambiguator: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            disambiguator: disambiguator.into(),
        }
    }

    /// Entry ordered only by primary key
    pub fn value(value: impl Into<String>) -> Self {
        Self::new(value, "")
    }
}

/// A named secondary index over projection state.
///
/// `extract` returns the entries a state contributes; an empty vec leaves the
/// state out of the index.
pub struct Index<S> {
    pub name: &'static str,
    pub extract: fn(&S) -> Vec<IndexEntry>,
}

impl<S> Index<S> {
    pub const fn new(name: &'static str, extract: fn(&S) -> Vec<IndexEntry>) -> Self {
        Self { name, extract }
    }
}

/// Zero-padded decimal so lexicographic order matches numeric order
pub fn ordered(n: u64) -> String {
    format!("{:020}", n)
}

/// Join the parts of a composite index value
pub fn composite(parts: &[&str]) -> String {
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_sorts_numerically() {
        let mut values = vec![ordered(10), ordered(9), ordered(100)];
        values.sort();
        assert_eq!(values, vec![ordered(9), ordered(10), ordered(100)]);
    }
}
