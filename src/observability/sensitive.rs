//! Redaction for bound parameter values.
//!
//! Generated SQL is logged verbatim, but the values bound to its placeholders
//! and the named parameters of a plan may carry user data. Wrapping them in
//! [`Sensitive`] keeps their shape visible (how many values, which parameter
//! names) while masking every value.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};

use serde::{Serialize, Serializer};

use crate::engine::types::Value;

const MASK: &str = "***";

/// Describes a value without revealing it
pub trait Redact {
    fn redacted(&self, f: &mut Formatter<'_>) -> fmt::Result;
}

impl Redact for Value {
    fn redacted(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            _ => f.write_str(MASK),
        }
    }
}

impl Redact for [Value] {
    fn redacted(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bound values]", self.len())
    }
}

impl Redact for Vec<Value> {
    fn redacted(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.as_slice().redacted(f)
    }
}

/// Parameter names stay readable, sorted for stable output.
impl Redact for HashMap<String, Value> {
    fn redacted(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.write_str("{")?;
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, ":{name} = {MASK}")?;
        }
        f.write_str("}")
    }
}

impl<T: Redact + ?Sized> Redact for &T {
    fn redacted(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).redacted(f)
    }
}

/// Wrapper whose `Debug`, `Display` and `Serialize` output is redacted.
#[derive(Clone, PartialEq)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// The wrapped value, unredacted.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Redact> Debug for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.redacted(f)
    }
}

impl<T: Redact> Display for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.redacted(f)
    }
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(MASK)
    }
}
