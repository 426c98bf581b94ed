// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Schemas
//!
//! Payloads cross the publish/consume boundary as `serde_json::Value` and are
//! checked against a `MessageSchema` before they are published or handed to a
//! handler. `TypedSchema<T>` validates by deserializing into `T`, so any serde
//! type doubles as a schema.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, marker::PhantomData};

/// One structured problem found while validating a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    /// Dotted path to the offending field, empty for the root value
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        SchemaIssue {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Validates a decoded JSON value.
pub trait MessageSchema: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>>;
}

/// Schema backed by a serde type: a value is valid when it deserializes into `T`.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        TypedSchema {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageSchema for TypedSchema<T>
where
    T: DeserializeOwned,
{
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>> {
        match T::deserialize(value) {
            Ok(_) => Ok(()),
            Err(err) => Err(vec![SchemaIssue::new("", err.to_string())]),
        }
    }
}

/// Schema that accepts any JSON object, used for messages without a declared shape.
pub struct AnyObject;

impl MessageSchema for AnyObject {
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>> {
        if value.is_object() {
            Ok(())
        } else {
            Err(vec![SchemaIssue::new("", "expected a JSON object")])
        }
    }
}

impl<F> MessageSchema for F
where
    F: Fn(&Value) -> Result<(), Vec<SchemaIssue>> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>> {
        self(value)
    }
}
