//! Zone selectors: macro templates the host expands into zone keys.
//!
//! A selector is literal text with embedded `%{NAME}` or `%{COLLECTION.key}`
//! references, e.g. `%{REQUEST_HEADERS.host}` or `api-%{ARGS.tenant}`.

use std::fmt;

/// One piece of a parsed selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Literal text copied into the zone key as-is
    Literal(String),
    /// A variable reference resolved by the host
    Variable {
        /// Collection name, e.g. `REQUEST_HEADERS`
        collection: String,
        /// Optional member of the collection, e.g. `host`
        key: Option<String>,
    },
}

/// A validated zone selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZoneSelector {
    raw: String,
    segments: Vec<Segment>,
}

/// Reasons a selector fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("unterminated macro starting at byte {0}")]
    Unterminated(usize),
    #[error("empty macro at byte {0}")]
    EmptyMacro(usize),
    #[error("invalid character {ch:?} in macro {name:?}")]
    InvalidCharacter { name: String, ch: char },
}

fn is_macro_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

impl ZoneSelector {
    /// Parse and validate a selector.
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        if raw.is_empty() {
            return Err(SelectorError::Empty);
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;
        let mut offset = 0;

        while let Some(start) = rest.find("%{") {
            literal.push_str(&rest[..start]);
            let body = &rest[start + 2..];
            let end = body
                .find('}')
                .ok_or(SelectorError::Unterminated(offset + start))?;
            let name = &body[..end];

            if name.is_empty() {
                return Err(SelectorError::EmptyMacro(offset + start));
            }
            if let Some(ch) = name.chars().find(|c| !is_macro_char(*c)) {
                return Err(SelectorError::InvalidCharacter {
                    name: name.to_string(),
                    ch,
                });
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(match name.split_once('.') {
                Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {
                    Segment::Variable {
                        collection: collection.to_string(),
                        key: Some(key.to_string()),
                    }
                }
                Some(_) => {
                    return Err(SelectorError::InvalidCharacter {
                        name: name.to_string(),
                        ch: '.',
                    })
                }
                None => Segment::Variable {
                    collection: name.to_string(),
                    key: None,
                },
            });

            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The selector text as written in the directive.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed segments in order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the selector has no variable references.
    pub fn is_constant(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Expand the selector, resolving variables through `lookup`.
    ///
    /// Variables the lookup does not know expand to nothing.
    pub fn expand<F>(&self, mut lookup: F) -> String
    where
        F: FnMut(&str, Option<&str>) -> Option<String>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable { collection, key } => {
                    if let Some(value) = lookup(collection, key.as_deref()) {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }
}

impl fmt::Display for ZoneSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
