// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Variable registry - names and types of every variable a method's tree refers to.

use super::node::VariableId;
use crate::bytecode::MethodBody;
use crate::types::{SemanticType, TypeLookup};
use crate::error::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Flattened registry entry handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableInfo {
    pub id: VariableId,
    pub name: String,
    pub ty: SemanticType,
    pub parameter: bool,
}

#[derive(Default, Debug, Clone)]
pub struct VariableRegistry {
    names: BTreeMap<VariableId, String>,
    types: BTreeMap<VariableId, SemanticType>,
    parameters: BTreeSet<VariableId>,
    /// Locals without a source name (compiler-synthesized slots).
    synthetic: BTreeSet<VariableId>,
    next_stack: usize,
    next_temp: usize,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the local variable table; the receiver and parameters come first.
    pub fn for_method(method: &MethodBody, types: &dyn TypeLookup) -> Result<Self> {
        let mut registry = Self::new();
        let (params, _) = types.resolve_method(&method.descriptor)?;
        let parameter_count = params.len() + usize::from(!method.is_static);
        for (index, local) in method.locals.iter().enumerate() {
            let id = VariableId::Local(index as u16);
            let ty = types.resolve(&local.descriptor)?;
            let name = match &local.name {
                Some(name) => name.clone(),
                None => {
                    registry.synthetic.insert(id);
                    format!("var{}", index)
                }
            };
            registry.register(id, name, ty);
            if index < parameter_count {
                registry.parameters.insert(id);
            }
        }
        Ok(registry)
    }

    pub fn get_name(&self, id: VariableId) -> Option<&str> {
        self.names.get(&id).map(|s| s.as_str())
    }

    pub fn get_type(&self, id: VariableId) -> Option<&SemanticType> {
        self.types.get(&id)
    }

    pub fn register(&mut self, id: VariableId, name: String, ty: SemanticType) {
        self.names.insert(id, name);
        self.types.insert(id, ty);
    }

    pub fn set_type(&mut self, id: VariableId, ty: SemanticType) {
        self.types.insert(id, ty);
    }

    pub fn is_parameter(&self, id: VariableId) -> bool {
        self.parameters.contains(&id)
    }

    /// Variables introduced by the compiler or by reconstruction, never by the source.
    pub fn is_synthetic(&self, id: VariableId) -> bool {
        match id {
            VariableId::Local(_) => self.synthetic.contains(&id),
            VariableId::Stack(_) | VariableId::Temp(_) => true,
        }
    }

    pub fn fresh_stack(&mut self, ty: SemanticType) -> VariableId {
        let id = VariableId::Stack(self.next_stack);
        self.next_stack += 1;
        self.register(id, format!("stack{}", self.next_stack - 1), ty);
        id
    }

    pub fn fresh_temp(&mut self, ty: SemanticType) -> VariableId {
        let id = VariableId::Temp(self.next_temp);
        self.next_temp += 1;
        self.register(id, format!("tmp{}", self.next_temp - 1), ty);
        id
    }

    pub fn all_variables(&self) -> Vec<VariableId> {
        self.names.keys().copied().collect()
    }

    pub fn entries(&self) -> Vec<VariableInfo> {
        self.names
            .iter()
            .map(|(id, name)| VariableInfo {
                id: *id,
                name: name.clone(),
                ty: self.types.get(id).cloned().unwrap_or(SemanticType::Void),
                parameter: self.parameters.contains(id),
            })
            .collect()
    }
}
