//! Dynamic keyword arguments passed to scheduled functions.
//!
//! Scheduled functions are called with keyword arguments only, so that a new
//! version of a function can inherit whatever the previous version was called
//! with. [`CallArgs`] still carries a positional list so that callers that pass
//! positional values get a clear [`Error::BadArgument`] instead of silently
//! losing them.

use crate::error::{Error, Result};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

/// A single argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// Returns the value as a float if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the value as an integer if it is an integer or a whole float.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Interprets a bare literal: booleans, integers, floats, anything else is a string.
    pub fn parse_literal(text: &str) -> Value {
        match text {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            return Value::Float(f);
        }
        Value::Str(text.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// An ordered map of keyword arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(BTreeMap<String, Value>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    /// Returns these arguments layered over `base`.
    ///
    /// Keys missing here are taken from `base`; keys present here always win.
    pub fn inherit(&self, base: &Args) -> Args {
        let mut merged = base.clone();
        for (key, value) in &self.0 {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Args {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = Args::new();
        for (key, value) in iter {
            args.insert(key, value);
        }
        args
    }
}

impl<'a> IntoIterator for &'a Args {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The arguments of one scheduling call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    keywords: Args,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a keyword argument.
    pub fn kw(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keywords.insert(key, value);
        self
    }

    /// Adds a positional argument. Scheduling calls reject these.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &Args {
        &self.keywords
    }

    /// Converts into keyword arguments, failing if any positional value was given.
    pub fn into_keywords(self, function: &str) -> Result<Args> {
        if !self.positional.is_empty() {
            return Err(Error::BadArgument {
                function: function.to_string(),
                reason: format!(
                    "{} positional argument(s) given, scheduled functions take keyword arguments only",
                    self.positional.len()
                ),
            });
        }
        Ok(self.keywords)
    }
}

impl From<Args> for CallArgs {
    fn from(keywords: Args) -> Self {
        CallArgs {
            positional: Vec::new(),
            keywords,
        }
    }
}

/// Builds an [`Args`] map: `args! { p => 0.5, note => "c4" }`.
#[macro_export]
macro_rules! args {
    () => {
        $crate::args::Args::new()
    };
    ($($key:ident => $value:expr),+ $(,)?) => {{
        let mut args = $crate::args::Args::new();
        $(args.insert(stringify!($key), $value);)+
        args
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherit_keeps_missing_keys_and_overrides_present_ones() {
        let base = args! { a => 1, b => 2 };
        assert_eq!(args! {}.inherit(&base), args! { a => 1, b => 2 });
        assert_eq!(args! { b => 5 }.inherit(&base), args! { a => 1, b => 5 });
        assert_eq!(
            args! { c => "x" }.inherit(&base),
            args! { a => 1, b => 2, c => "x" }
        );
    }

    #[test]
    fn positional_arguments_are_rejected() {
        let call = CallArgs::new().arg(1).kw("p", 0.5);
        match call.into_keywords("kick") {
            Err(Error::BadArgument { function, .. }) => assert_eq!(function, "kick"),
            other => panic!("expected BadArgument, got {other:?}"),
        }
        let call = CallArgs::new().kw("p", 0.5);
        assert_eq!(call.into_keywords("kick").unwrap(), args! { p => 0.5 });
    }

    #[test]
    fn literals_are_typed() {
        assert_eq!(Value::parse_literal("3"), Value::Int(3));
        assert_eq!(Value::parse_literal("0.25"), Value::Float(0.25));
        assert_eq!(Value::parse_literal("true"), Value::Bool(true));
        assert_eq!(Value::parse_literal("bd"), Value::Str("bd".into()));
    }

    #[test]
    fn numeric_accessors() {
        let args = args! { p => 2, q => 0.5, name => "hat" };
        assert_eq!(args.f64("p"), Some(2.0));
        assert_eq!(args.i64("q"), None);
        assert_eq!(args.str("name"), Some("hat"));
        assert_eq!(args.to_string(), "name=\"hat\" p=2 q=0.5");
    }
}
