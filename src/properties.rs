//! Typed key/value store backing device and channel configuration.
//!
//! Keys are hierarchical strings (`chans.data.0.address`). Values are typed;
//! `get` requests are type-checked at runtime. Every successful `set` emits
//! two events: [`PropertyChange`] carrying the typed value and
//! [`PropertyChangeAsString`] carrying the value converted to text together
//! with its declared type name. The store is a linearizable register per
//! key: all operations go through one internal mutex, and subscribers run
//! synchronously on the setter's thread.

use crate::error::ConfigError;
use crate::events::{Event, EventManager};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A type-erased property value: scalars, strings, or ordered sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Property {
    Bool(bool),
    I32(i32),
    I64(i64),
    U16(u16),
    U64(u64),
    F64(f64),
    String(String),
    Strings(Vec<String>),
    Ints(Vec<i64>),
    Doubles(Vec<f64>),
}

impl Property {
    pub fn type_name(&self) -> &'static str {
        match self {
            Property::Bool(_) => "bool",
            Property::I32(_) => "i32",
            Property::I64(_) => "i64",
            Property::U16(_) => "u16",
            Property::U64(_) => "u64",
            Property::F64(_) => "f64",
            Property::String(_) => "string",
            Property::Strings(_) => "vector<string>",
            Property::Ints(_) => "vector<i64>",
            Property::Doubles(_) => "vector<f64>",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Bool(v) => write!(f, "{v}"),
            Property::I32(v) => write!(f, "{v}"),
            Property::I64(v) => write!(f, "{v}"),
            Property::U16(v) => write!(f, "{v}"),
            Property::U64(v) => write!(f, "{v}"),
            Property::F64(v) => write!(f, "{v}"),
            Property::String(v) => write!(f, "{v}"),
            Property::Strings(v) => write!(f, "{}", v.join(",")),
            Property::Ints(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
            Property::Doubles(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

macro_rules! property_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Property {
                fn from(v: $ty) -> Self {
                    Property::$variant(v)
                }
            }

            impl TryFrom<Property> for $ty {
                type Error = &'static str;

                fn try_from(p: Property) -> Result<Self, Self::Error> {
                    match p {
                        Property::$variant(v) => Ok(v),
                        _ => Err(stringify!($ty)),
                    }
                }
            }
        )*
    };
}

property_conversions! {
    Bool => bool,
    I32 => i32,
    I64 => i64,
    U16 => u16,
    U64 => u64,
    F64 => f64,
    String => String,
    Strings => Vec<String>,
    Ints => Vec<i64>,
    Doubles => Vec<f64>,
}

impl From<&str> for Property {
    fn from(v: &str) -> Self {
        Property::String(v.to_owned())
    }
}

/// Emitted on every successful set, carrying the typed value.
pub struct PropertyChange;
impl Event for PropertyChange {
    type Key = String;
    type Payload = Property;
}

/// Emitted on every successful set, carrying `(value as text, type name)`.
pub struct PropertyChangeAsString;
impl Event for PropertyChangeAsString {
    type Key = String;
    type Payload = (String, String);
}

pub struct PropertyStore {
    values: Mutex<BTreeMap<String, Property>>,
    events: Arc<EventManager>,
}

impl PropertyStore {
    pub fn new(events: Arc<EventManager>) -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Store `value` under `key` and notify subscribers of both change
    /// events. Replaces any previous value regardless of its type.
    pub fn set(&self, key: &str, value: impl Into<Property>) {
        let value = value.into();
        let stringified = (value.to_string(), value.type_name().to_owned());
        {
            let mut values = self.values.lock();
            values.insert(key.to_owned(), value.clone());
        }
        let key = key.to_owned();
        self.events.emit::<PropertyChange>(&key, &value);
        self.events.emit::<PropertyChangeAsString>(&key, &stringified);
    }

    pub fn get(&self, key: &str) -> Option<Property> {
        self.values.lock().get(key).cloned()
    }

    /// Type-checked read; a present value of the wrong type is an error.
    pub fn get_as<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: TryFrom<Property, Error = &'static str>,
    {
        match self.get(key) {
            None => Ok(None),
            Some(value) => {
                let actual = value.type_name();
                T::try_from(value)
                    .map(Some)
                    .map_err(|requested| ConfigError::TypeMismatch {
                        key: key.to_owned(),
                        actual,
                        requested,
                    })
            }
        }
    }

    /// Like [`get_as`](Self::get_as) with a fallback for missing keys.
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: TryFrom<Property, Error = &'static str>,
    {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Property> {
        self.values.lock().remove(key)
    }

    /// Snapshot of all keys sharing `prefix`, in key order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<(String, Property)> {
        self.values
            .lock()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }
}
