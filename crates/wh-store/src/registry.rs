//! The serialization registry (`spec.md` §4.6): envelopes carry a
//! fully-qualified type descriptor plus opaque JSON; resolution happens
//! through a name-to-decoder map keyed on the *normalized* descriptor so
//! producer/consumer version skew never breaks decoding.
//!
//! Per the `spec.md` §9 design note ("global mutable JSON context
//! registry → populated exactly once at startup, read-only thereafter,
//! read concurrently without locking"), `TypeRegistry` is built once via
//! `TypeRegistryBuilder` and is immutable — and therefore `Sync` with no
//! internal lock — from the moment `build()` returns.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

type Decoder = Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Any + Send>, RegistryError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no decoder registered for type {type_name}")]
    UnknownType { type_name: String },

    #[error("decoded value for {type_name} did not match the requested type")]
    TypeMismatch { type_name: String },

    #[error("deserialization failed for {type_name}: {message}")]
    DeserializeFailed { type_name: String, message: String },
}

/// Strips version/culture/public-key-token tails from a fully-qualified
/// type descriptor, recursively for generic arguments.
///
/// A descriptor is `TypeName[, AssemblyInfo]` where `AssemblyInfo` is a
/// comma-separated tail (`Version=..., Culture=..., PublicKeyToken=...`)
/// that producer and consumer builds may disagree on. Generic arguments
/// are written `Outer\`1[[Inner, InnerAssemblyInfo]]`; each bracketed
/// argument gets the same treatment.
pub fn normalize_type_name(raw: &str) -> String {
    let type_part = top_level_type_part(raw.trim());
    normalize_generic_args(&type_part)
}

/// Returns everything before the first top-level comma (a comma not
/// nested inside `[...]`), trimmed.
fn top_level_type_part(s: &str) -> String {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => return s[..i].trim().to_string(),
            _ => {}
        }
    }
    s.trim().to_string()
}

/// If `type_part` carries a generic argument list (`Name\`N[[...]]`),
/// normalizes each argument recursively; otherwise returns it unchanged.
fn normalize_generic_args(type_part: &str) -> String {
    let Some(start) = type_part.find('[') else {
        return type_part.to_string();
    };
    let prefix = &type_part[..start];
    let inner = strip_outer_brackets(&type_part[start..]);
    let args: Vec<String> = split_top_level_args(&inner)
        .iter()
        .map(|a| normalize_type_name(&strip_outer_brackets(a)))
        .collect();
    format!("{}[[{}]]", prefix, args.join("],["))
}

/// Removes one layer of surrounding `[` `]` if present.
fn strip_outer_brackets(s: &str) -> String {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        stripped.to_string()
    } else {
        s.to_string()
    }
}

/// Splits a `[Arg1],[Arg2],...` argument list on the top-level `],[`
/// boundaries, preserving nested bracket structure within each `Arg`.
fn split_top_level_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                args.push(s[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(s[start..].to_string());
    args
}

/// Accumulates `register::<T>(name)` calls before freezing into a
/// `TypeRegistry`. Mirrors a code-generated startup initializer without
/// requiring one: the host calls `register` once per known envelope
/// type, typically from a `fn register_all(builder) -> builder` it owns.
#[derive(Default)]
pub struct TypeRegistryBuilder {
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for `type_name` (any spelling; normalized on
    /// both register and lookup, so producer/consumer skew is absorbed).
    pub fn register<T>(mut self, type_name: &str) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = normalize_type_name(type_name);
        let owned_name = type_name.to_string();
        let decoder: Decoder = Arc::new(move |value| {
            serde_json::from_value::<T>(value).map(|t| Box::new(t) as Box<dyn Any + Send>).map_err(|e| {
                RegistryError::DeserializeFailed {
                    type_name: owned_name.clone(),
                    message: e.to_string(),
                }
            })
        });
        self.decoders.insert(key, decoder);
        self
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            decoders: self.decoders,
        }
    }
}

/// Immutable, populated once at startup, read concurrently without a
/// lock for the rest of the process's life.
pub struct TypeRegistry {
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistry {
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(&normalize_type_name(type_name))
    }

    pub fn decode<T: 'static>(
        &self,
        type_name: &str,
        data: serde_json::Value,
    ) -> Result<T, RegistryError> {
        let key = normalize_type_name(type_name);
        let decoder = self
            .decoders
            .get(&key)
            .ok_or_else(|| RegistryError::UnknownType {
                type_name: type_name.to_string(),
            })?;
        let boxed = decoder(data)?;
        boxed.downcast::<T>().map(|b| *b).map_err(|_| RegistryError::TypeMismatch {
            type_name: type_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderCreated {
        order_id: String,
    }

    #[test]
    fn strips_assembly_version_tail() {
        let raw = "MyNamespace.OrderCreated, MyAssembly, Version=1.2.0.0, Culture=neutral, PublicKeyToken=null";
        assert_eq!(normalize_type_name(raw), "MyNamespace.OrderCreated");
    }

    #[test]
    fn name_without_assembly_tail_is_unchanged() {
        assert_eq!(normalize_type_name("MyNamespace.OrderCreated"), "MyNamespace.OrderCreated");
    }

    #[test]
    fn strips_tails_recursively_from_generic_arguments() {
        let raw = "MyNamespace.Envelope`1[[MyNamespace.OrderCreated, MyAssembly, Version=1.0.0.0]], MyAssembly, Version=2.0.0.0";
        assert_eq!(
            normalize_type_name(raw),
            "MyNamespace.Envelope`1[[MyNamespace.OrderCreated]]"
        );
    }

    #[test]
    fn producer_and_consumer_version_skew_normalizes_to_the_same_key() {
        let producer = "MyNamespace.OrderCreated, MyAssembly, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null";
        let consumer = "MyNamespace.OrderCreated, MyAssembly, Version=1.1.0.0, Culture=neutral, PublicKeyToken=null";
        assert_eq!(normalize_type_name(producer), normalize_type_name(consumer));
    }

    #[test]
    fn decode_round_trips_a_registered_type() {
        let registry = TypeRegistryBuilder::new()
            .register::<OrderCreated>("MyNamespace.OrderCreated, MyAssembly, Version=1.0.0.0")
            .build();
        let data = serde_json::json!({ "order_id": "abc-123" });
        let decoded: OrderCreated = registry
            .decode("MyNamespace.OrderCreated, MyAssembly, Version=9.9.9.9", data)
            .unwrap();
        assert_eq!(decoded, OrderCreated { order_id: "abc-123".to_string() });
    }

    #[test]
    fn decode_unknown_type_is_an_error() {
        let registry = TypeRegistryBuilder::new().build();
        let err = registry
            .decode::<OrderCreated>("MyNamespace.Unregistered", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType { .. }));
    }

    #[test]
    fn contains_checks_normalized_name() {
        let registry = TypeRegistryBuilder::new()
            .register::<OrderCreated>("MyNamespace.OrderCreated, MyAssembly, Version=1.0.0.0")
            .build();
        assert!(registry.contains("MyNamespace.OrderCreated, MyAssembly, Version=5.0.0.0"));
        assert!(!registry.contains("MyNamespace.SomethingElse"));
    }
}
