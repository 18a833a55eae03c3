//! Option-string parsing: `name[:key=value[,key=value...]]` (§6).
//!
//! This is deliberately a small hand-rolled parser rather than a general
//! grammar engine — the format is one line of the wire contract, not a
//! subsystem in its own right.

use std::collections::BTreeMap;

/// A parsed option string: a codec name plus an ordered set of key/value
/// pairs. The canonical key for the codec name itself, when it also
/// needs to appear inside the map (e.g. for `equiv` comparisons), is
/// `%name`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Options {
    /// The `name` component preceding the first `:`.
    pub name: String,
    /// Parsed `key=value` pairs, in the order they appeared.
    entries: BTreeMap<String, String>,
}

impl Options {
    /// Parse `s` as an option string. Returns [`crate::Error::ParseError`]
    /// with the byte offset of the offending character on malformed
    /// input.
    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        let (name, rest) = match s.find(':') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(crate::Error::ParseError {
                offset: 0,
                message: "empty codec name".to_string(),
            });
        }
        let mut entries = BTreeMap::new();
        if let Some(rest) = rest {
            let base_offset = name.len() + 1;
            let mut cursor = base_offset;
            for part in rest.split(',') {
                if part.is_empty() {
                    return Err(crate::Error::ParseError {
                        offset: cursor,
                        message: "empty key=value segment".to_string(),
                    });
                }
                let eq = part.find('=').ok_or_else(|| crate::Error::ParseError {
                    offset: cursor,
                    message: "missing '=' in option".to_string(),
                })?;
                let (key, value) = (&part[..eq], &part[eq + 1..]);
                if key.is_empty() {
                    return Err(crate::Error::ParseError {
                        offset: cursor,
                        message: "empty option key".to_string(),
                    });
                }
                entries.insert(key.to_string(), value.to_string());
                cursor += part.len() + 1;
            }
        }
        Ok(Self {
            name: name.to_string(),
            entries,
        })
    }

    /// Look up an option value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterate `(key, value)` pairs in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Equivalence predicate used by the reencoder planner (§4.7) to
    /// decide whether a [`crate::reencode::Reencoder::DirectCopy`] is
    /// legal: two option sets are equivalent if they carry the same
    /// key/value pairs (the codec name is compared separately by the
    /// caller).
    pub fn equiv(&self, other: &Options) -> bool {
        self.entries == other.entries
    }
}

impl std::fmt::Display for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.entries.is_empty() {
            write!(f, ":")?;
            let mut first = true;
            for (k, v) in &self.entries {
                if !first {
                    write!(f, ",")?;
                }
                first = false;
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name() {
        let opts = Options::parse("raw").unwrap();
        assert_eq!(opts.name, "raw");
        assert_eq!(opts.iter().count(), 0);
    }

    #[test]
    fn parses_name_with_options() {
        let opts = Options::parse("jpeg:q=80,subsample=420").unwrap();
        assert_eq!(opts.name, "jpeg");
        assert_eq!(opts.get("q"), Some("80"));
        assert_eq!(opts.get("subsample"), Some("420"));
    }

    #[test]
    fn rejects_empty_name() {
        let err = Options::parse(":q=80").unwrap_err();
        assert!(matches!(err, crate::Error::ParseError { offset: 0, .. }));
    }

    #[test]
    fn rejects_missing_equals() {
        assert!(Options::parse("jpeg:q").is_err());
    }

    #[test]
    fn equiv_ignores_order() {
        let a = Options::parse("jpeg:q=80,subsample=420").unwrap();
        let b = Options::parse("jpeg:subsample=420,q=80").unwrap();
        assert!(a.equiv(&b));
    }

    #[test]
    fn equiv_detects_difference() {
        let a = Options::parse("jpeg:q=80").unwrap();
        let b = Options::parse("jpeg:q=90").unwrap();
        assert!(!a.equiv(&b));
    }
}
