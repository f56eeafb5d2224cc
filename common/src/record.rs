use serde::{de::DeserializeOwned, Serialize};

/// A fixed-arity row type. Fields are (de)serialized positionally, in the
/// order given by `FIELDS`.
pub trait Record: Serialize + DeserializeOwned {
    const FIELDS: &'static [&'static str];

    fn arity() -> usize {
        Self::FIELDS.len()
    }

    fn field_index(name: &str) -> Option<usize> {
        Self::FIELDS.iter().position(|field| *field == name)
    }
}
