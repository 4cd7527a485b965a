//! Parameter sets passed to statements.

use super::value::{Record, Value};
use indexmap::IndexMap;
use serde::Serialize;

/// A parameter value: a scalar, or a list that expands into an `IN (...)` marker list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Scalar(Value),
    List(Vec<Value>),
}

macro_rules! impl_param_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    ParamValue::Scalar(v.into())
                }
            }
        )+
    };
}

impl_param_from!(
    Value,
    bool,
    i32,
    i64,
    u32,
    f64,
    String,
    &str,
    chrono::NaiveDateTime,
    chrono::NaiveDate,
);

impl From<Vec<Value>> for ParamValue {
    fn from(values: Vec<Value>) -> Self {
        ParamValue::List(values)
    }
}

/// Named (`:name`) and positional (`%N`) parameters for one statement invocation.
///
/// Named entries keep insertion order; positional entries are 1-based in
/// template terms (`%1` is the first value pushed with [`Params::at`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Params {
    named: IndexMap<String, ParamValue>,
    positional: Vec<Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named scalar parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Add a named list parameter.
    pub fn with_list<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.named.insert(
            name.into(),
            ParamValue::List(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Append the next positional text-substitution value.
    pub fn at(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.named.insert(name.into(), ParamValue::Scalar(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.named.get(name)
    }

    /// Positional value for `%index` (1-based).
    pub fn positional(&self, index: usize) -> Option<&Value> {
        index.checked_sub(1).and_then(|i| self.positional.get(i))
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }

    pub fn named(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl From<Record> for Params {
    fn from(record: Record) -> Self {
        let mut params = Params::new();
        for (column, value) in record {
            params.set(column, value);
        }
        params
    }
}

impl From<&Record> for Params {
    fn from(record: &Record) -> Self {
        Params::from(record.clone())
    }
}
