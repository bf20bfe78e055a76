// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Semantic types and the type-lookup service consumed by the builder.

use crate::bytecode::{NumericKind, PrimitiveKind};
use crate::error::{ReconstructionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Internal class name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<SemanticType>),
    /// Type of the `null` literal before it meets a context.
    Null,
}

impl SemanticType {
    pub fn string() -> Self {
        SemanticType::Object("java/lang/String".to_string())
    }

    pub fn throwable() -> Self {
        SemanticType::Object("java/lang/Throwable".to_string())
    }

    /// Long and double occupy two operand stack words.
    pub fn is_wide(&self) -> bool {
        matches!(self, SemanticType::Long | SemanticType::Double)
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            SemanticType::Object(_) | SemanticType::Array(_) | SemanticType::Null
        )
    }

    /// Types the JVM represents as `int` on the operand stack.
    pub fn is_int_like(&self) -> bool {
        matches!(
            self,
            SemanticType::Boolean
                | SemanticType::Byte
                | SemanticType::Char
                | SemanticType::Short
                | SemanticType::Int
        )
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, SemanticType::Float | SemanticType::Double)
    }

    pub fn from_numeric(kind: NumericKind) -> Self {
        match kind {
            NumericKind::Int => SemanticType::Int,
            NumericKind::Long => SemanticType::Long,
            NumericKind::Float => SemanticType::Float,
            NumericKind::Double => SemanticType::Double,
        }
    }

    pub fn from_primitive(kind: PrimitiveKind) -> Self {
        match kind {
            PrimitiveKind::Boolean => SemanticType::Boolean,
            PrimitiveKind::Byte => SemanticType::Byte,
            PrimitiveKind::Char => SemanticType::Char,
            PrimitiveKind::Short => SemanticType::Short,
            PrimitiveKind::Int => SemanticType::Int,
            PrimitiveKind::Long => SemanticType::Long,
            PrimitiveKind::Float => SemanticType::Float,
            PrimitiveKind::Double => SemanticType::Double,
        }
    }

    pub fn element(&self) -> Option<&SemanticType> {
        match self {
            SemanticType::Array(element) => Some(element),
            _ => None,
        }
    }
}

/// Parses a field descriptor (`I`, `[J`, `Ljava/lang/String;`).
pub fn parse_descriptor(descriptor: &str) -> Option<SemanticType> {
    let (ty, rest) = parse_prefix(descriptor)?;
    rest.is_empty().then_some(ty)
}

/// Parses a method descriptor into parameter types and the return type.
pub fn parse_method_descriptor(descriptor: &str) -> Option<(Vec<SemanticType>, SemanticType)> {
    let mut rest = descriptor.strip_prefix('(')?;
    let mut parameters = vec![];
    while !rest.starts_with(')') {
        let (ty, tail) = parse_prefix(rest)?;
        parameters.push(ty);
        rest = tail;
    }
    let rest = &rest[1..];
    let ret = if rest == "V" {
        SemanticType::Void
    } else {
        parse_descriptor(rest)?
    };
    Some((parameters, ret))
}

fn parse_prefix(descriptor: &str) -> Option<(SemanticType, &str)> {
    let first = descriptor.chars().next()?;
    let rest = &descriptor[first.len_utf8()..];
    let ty = match first {
        'Z' => SemanticType::Boolean,
        'B' => SemanticType::Byte,
        'C' => SemanticType::Char,
        'S' => SemanticType::Short,
        'I' => SemanticType::Int,
        'J' => SemanticType::Long,
        'F' => SemanticType::Float,
        'D' => SemanticType::Double,
        'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            return Some((SemanticType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (element, tail) = parse_prefix(rest)?;
            return Some((SemanticType::Array(Box::new(element)), tail));
        }
        _ => return None,
    };
    Some((ty, rest))
}

/// Resolution service for descriptors and enum constants.
///
/// Implementations are shared across concurrently reconstructed methods and must only
/// ever add entries to whatever cache they keep.
pub trait TypeLookup: Send + Sync {
    fn resolve(&self, descriptor: &str) -> Result<SemanticType>;

    fn resolve_method(&self, descriptor: &str) -> Result<(Vec<SemanticType>, SemanticType)>;

    /// Constant names of an enum type in ordinal order.
    fn enum_constants(&self, enum_type: &str) -> Option<Vec<String>>;

    /// Contents of a javac `$SwitchMap$` table as filled in by its static initializer:
    /// the switch key stored for each enum constant, keyed by that value. `owner` is the
    /// class declaring the table field.
    fn switch_map(&self, _owner: &str, _table: &str) -> Option<BTreeMap<i32, String>> {
        None
    }
}

/// Lookup that understands plain descriptors plus fixed tables of enum types and
/// switch maps.
#[derive(Default)]
pub struct DescriptorTypeLookup {
    fields: RwLock<BTreeMap<String, SemanticType>>,
    methods: RwLock<BTreeMap<String, (Vec<SemanticType>, SemanticType)>>,
    enums: BTreeMap<String, Vec<String>>,
    /// Keyed by `Owner.$SwitchMap$...`.
    switch_maps: BTreeMap<String, BTreeMap<i32, String>>,
}

impl DescriptorTypeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enums(enums: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            enums,
            ..Self::default()
        }
    }

    pub fn with_switch_maps(self, switch_maps: BTreeMap<String, BTreeMap<i32, String>>) -> Self {
        Self { switch_maps, ..self }
    }

    pub fn switch_map_key(owner: &str, table: &str) -> String {
        format!("{}.{}", owner, table)
    }

    fn cached<T: Clone>(
        cache: &RwLock<BTreeMap<String, T>>,
        descriptor: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<T> {
        if let Ok(entries) = cache.read() {
            if let Some(found) = entries.get(descriptor) {
                return Ok(found.clone());
            }
        }
        let parsed = parse(descriptor).ok_or_else(|| {
            ReconstructionError::unsupported(0, format!("malformed descriptor `{}`", descriptor))
        })?;
        if let Ok(mut entries) = cache.write() {
            // Another thread may have won the race; keep its entry untouched.
            entries
                .entry(descriptor.to_string())
                .or_insert_with(|| parsed.clone());
        }
        Ok(parsed)
    }
}

impl TypeLookup for DescriptorTypeLookup {
    fn resolve(&self, descriptor: &str) -> Result<SemanticType> {
        Self::cached(&self.fields, descriptor, parse_descriptor)
    }

    fn resolve_method(&self, descriptor: &str) -> Result<(Vec<SemanticType>, SemanticType)> {
        Self::cached(&self.methods, descriptor, parse_method_descriptor)
    }

    fn enum_constants(&self, enum_type: &str) -> Option<Vec<String>> {
        self.enums.get(enum_type).cloned()
    }

    fn switch_map(&self, owner: &str, table: &str) -> Option<BTreeMap<i32, String>> {
        self.switch_maps.get(&Self::switch_map_key(owner, table)).cloned()
    }
}
