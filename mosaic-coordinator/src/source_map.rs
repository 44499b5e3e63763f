//! Grouping of source tuples by participant, and the serialization grammar
//! used to persist that grouping in the write-ahead log.

use std::collections::BTreeMap;
use std::fmt;

/// Characters that would collide with the log grammar. Tuples containing
/// them are rejected at submission time, which keeps the grammar total and
/// its parser an exact inverse.
const RESERVED: &[char] = &['=', '[', ']', ',', '\t', '\n'];

/// Source files requested from each participant, keyed by participant
/// address. Within one participant, files keep first-seen submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap {
    inner: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SourceMapError {
    /// A submission tuple was not of the form `addr:file`, or used a
    /// character reserved by the log grammar.
    BadTuple(String),
    /// Persisted map text that does not parse back.
    BadGrammar(String),
}

impl fmt::Display for SourceMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadTuple(t) => write!(f, "malformed source tuple: {t:?}"),
            Self::BadGrammar(s) => write!(f, "malformed source map text: {s:?}"),
        }
    }
}

impl std::error::Error for SourceMapError {}

impl SourceMap {
    /// Group `addr:file` tuples by participant address.
    ///
    /// The split is at the first `:`, so filenames may contain colons.
    /// A participant appearing several times contributes one entry with all
    /// its files in first-seen order.
    ///
    /// # Errors
    ///
    /// Returns [`SourceMapError::BadTuple`] for tuples without a `:`, with
    /// an empty address or filename, or containing reserved characters.
    pub fn from_tuples<S: AsRef<str>>(tuples: &[S]) -> Result<Self, SourceMapError> {
        let mut inner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tuple in tuples {
            let tuple = tuple.as_ref();
            let bad = || SourceMapError::BadTuple(tuple.to_owned());
            let (addr, file) = tuple.split_once(':').ok_or_else(bad)?;
            if addr.is_empty() || file.is_empty() || tuple.contains(RESERVED) {
                return Err(bad());
            }
            inner
                .entry(addr.to_owned())
                .or_default()
                .push(file.to_owned());
        }
        Ok(Self { inner })
    }

    /// Parse the log grammar back into a map. Exact inverse of `Display`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceMapError::BadGrammar`] if `text` is not output of
    /// the `Display` impl.
    pub fn parse(text: &str) -> Result<Self, SourceMapError> {
        let bad = || SourceMapError::BadGrammar(text.to_owned());
        let body = text
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(bad)?;

        let mut inner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if body.is_empty() {
            return Ok(Self { inner });
        }
        for entry in body.split("], ") {
            let entry = entry.strip_suffix(']').unwrap_or(entry);
            let (addr, files) = entry.split_once("=[").ok_or_else(bad)?;
            if addr.is_empty() {
                return Err(bad());
            }
            let files = if files.is_empty() {
                Vec::new()
            } else {
                files.split(", ").map(str::to_owned).collect()
            };
            if inner.insert(addr.to_owned(), files).is_some() {
                return Err(bad());
            }
        }
        Ok(Self { inner })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Participant addresses, in map order.
    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// `(address, files)` pairs, in map order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inner.iter().map(|(a, f)| (a.as_str(), f.as_slice()))
    }
}

impl fmt::Display for SourceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut first = true;
        for (addr, files) in &self.inner {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{addr}=[{}]", files.join(", "))?;
        }
        f.write_str("}")
    }
}
