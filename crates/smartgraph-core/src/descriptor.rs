//! Static property capability tables.
//!
//! A `DescriptorTable` is built once per business-object type and shared by
//! every registry of that type. Derived tables start from their base and
//! shadow inherited entries by name.

use crate::{Result, SmartGraphError, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub is_read_only: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    type_name: String,
    properties: HashMap<String, PropertyDescriptor>,
}

impl DescriptorTable {
    pub fn builder(type_name: impl Into<String>) -> DescriptorTableBuilder {
        DescriptorTableBuilder {
            type_name: type_name.into(),
            inherited: Vec::new(),
            declared: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

pub struct DescriptorTableBuilder {
    type_name: String,
    inherited: Vec<PropertyDescriptor>,
    declared: Vec<PropertyDescriptor>,
}

impl DescriptorTableBuilder {
    /// Start from a base type's properties.
    pub fn inherits(mut self, base: &DescriptorTable) -> Self {
        self.inherited.extend(base.iter().cloned());
        self
    }

    pub fn property(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.descriptor(PropertyDescriptor::new(name, kind))
    }

    pub fn read_only(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.descriptor(PropertyDescriptor::new(name, kind).read_only())
    }

    pub fn descriptor(mut self, descriptor: PropertyDescriptor) -> Self {
        self.declared.push(descriptor);
        self
    }

    pub fn build(self) -> Result<DescriptorTable> {
        let mut seen = HashSet::new();
        for d in &self.declared {
            if d.name.trim().is_empty() {
                return Err(SmartGraphError::configuration(format!(
                    "type '{}' declares a property with an empty name",
                    self.type_name
                )));
            }
            if d.name.contains('.') {
                return Err(SmartGraphError::configuration(format!(
                    "property name '{}' on '{}' may not contain '.'",
                    d.name, self.type_name
                )));
            }
            if !seen.insert(d.name.as_str()) {
                return Err(SmartGraphError::configuration(format!(
                    "type '{}' declares property '{}' twice",
                    self.type_name, d.name
                )));
            }
        }

        let mut properties: HashMap<String, PropertyDescriptor> = self
            .inherited
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        // Most-derived wins.
        for d in self.declared {
            properties.insert(d.name.clone(), d);
        }

        Ok(DescriptorTable {
            type_name: self.type_name,
            properties,
        })
    }
}
