// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity catalog: the ordered list of replicated entity types.
//!
//! Each [`EntityDescriptor`] names its table, its surrogate identity column,
//! and an explicit list of columns. Foreign keys are columns that also point
//! at another catalogued type. Replication copies exactly the declared
//! columns, so nothing is discovered by introspection at runtime.
//!
//! The catalog order doubles as the replication order. [`EntityCatalog::new`]
//! checks that every foreign key targets a type appearing *earlier* in the
//! sequence, so parents are always written before their children:
//!
//! ```text
//! Institution → Level → Section → Teacher → Class → Student → Participation
//!                                   ▲          │
//!                                   └──────────┘ (class.teacher_id)
//! ```
//!
//! A catalog that violates the order is a configuration error and is
//! rejected at construction; it is never retried at runtime.

mod participation;

pub use participation::participation;

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::record::{FieldValue, Record};

/// Catalog configuration errors. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("entity '{0}' is declared more than once")]
    DuplicateEntity(String),
    #[error("entity '{entity}' declares field '{field}' more than once")]
    DuplicateField { entity: String, field: String },
    #[error("entity '{entity}' references unknown entity '{references}' via '{field}'")]
    UnknownReference {
        entity: String,
        field: String,
        references: String,
    },
    #[error("entity '{entity}' references '{references}' which is not ordered before it")]
    OutOfOrder { entity: String, references: String },
}

/// Storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
    Boolean,
    /// RFC 3339 text.
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Backed by a unique index; two records may not share a non-null value.
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Column on the referencing entity.
    pub field: &'static str,
    /// Name of the referenced entity.
    pub references: &'static str,
}

/// Static description of one replicated entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: &'static str,
    pub table: &'static str,
    pub id_field: &'static str,
    fields: Vec<FieldSpec>,
    foreign_keys: Vec<ForeignKey>,
}

impl EntityDescriptor {
    #[must_use]
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            id_field: "id",
            fields: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Required scalar column.
    #[must_use]
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            nullable: false,
            unique: false,
        });
        self
    }

    /// Required scalar column with a unique constraint.
    #[must_use]
    pub fn unique(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            nullable: false,
            unique: true,
        });
        self
    }

    /// Nullable scalar column.
    #[must_use]
    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            nullable: true,
            unique: false,
        });
        self
    }

    /// Required integer column referencing another entity's identity.
    #[must_use]
    pub fn foreign_key(mut self, field: &'static str, references: &'static str) -> Self {
        self.fields.push(FieldSpec {
            name: field,
            kind: FieldKind::Integer,
            nullable: false,
            unique: false,
        });
        self.foreign_keys.push(ForeignKey { field, references });
        self
    }

    /// All non-identity columns in declaration order (foreign keys included).
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    #[must_use]
    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Structural copy of `record` restricted to the declared columns.
    ///
    /// Undeclared fields are dropped and missing ones become `NULL`, which is
    /// what a whole-row overwrite in SQL would produce. Integers written to
    /// `Real` or `Boolean` columns are coerced to the column's kind, matching
    /// what a SQL store hands back on read.
    #[must_use]
    pub fn project(&self, record: &Record) -> Record {
        self.fields.iter().fold(Record::new(record.id()), |acc, spec| {
            let value = record.get(spec.name).cloned().unwrap_or(FieldValue::Null);
            acc.with(spec.name, coerce(spec.kind, value))
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn coerce(kind: FieldKind, value: FieldValue) -> FieldValue {
    match (kind, value) {
        (FieldKind::Real, FieldValue::Integer(v)) => FieldValue::Real(v as f64),
        (FieldKind::Boolean, FieldValue::Integer(v)) => FieldValue::Boolean(v != 0),
        (_, other) => other,
    }
}

/// Ordered, validated set of entity descriptors.
#[derive(Debug, Clone)]
pub struct EntityCatalog {
    entities: Vec<EntityDescriptor>,
    positions: HashMap<&'static str, usize>,
}

impl EntityCatalog {
    /// Build a catalog, enforcing the dependency-order invariant.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when a name or field is duplicated, a foreign
    /// key targets an unknown entity, or a parent is not ordered before its
    /// child.
    pub fn new(entities: Vec<EntityDescriptor>) -> Result<Self, CatalogError> {
        let mut positions = HashMap::with_capacity(entities.len());
        for (idx, entity) in entities.iter().enumerate() {
            if positions.insert(entity.name, idx).is_some() {
                return Err(CatalogError::DuplicateEntity(entity.name.to_string()));
            }

            let mut seen = HashSet::new();
            seen.insert(entity.id_field);
            for field in &entity.fields {
                if !seen.insert(field.name) {
                    return Err(CatalogError::DuplicateField {
                        entity: entity.name.to_string(),
                        field: field.name.to_string(),
                    });
                }
            }
        }

        for (idx, entity) in entities.iter().enumerate() {
            for fk in &entity.foreign_keys {
                match positions.get(fk.references) {
                    None => {
                        return Err(CatalogError::UnknownReference {
                            entity: entity.name.to_string(),
                            field: fk.field.to_string(),
                            references: fk.references.to_string(),
                        })
                    }
                    Some(&parent) if parent >= idx => {
                        return Err(CatalogError::OutOfOrder {
                            entity: entity.name.to_string(),
                            references: fk.references.to_string(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self { entities, positions })
    }

    /// Entity types in replication order.
    #[must_use]
    pub fn ordered_types(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    /// Foreign-key column names of `entity`, or `None` if it is not catalogued.
    #[must_use]
    pub fn foreign_keys_of(&self, entity: &str) -> Option<BTreeSet<&'static str>> {
        self.get(entity)
            .map(|e| e.foreign_keys.iter().map(|fk| fk.field).collect())
    }

    #[must_use]
    pub fn get(&self, entity: &str) -> Option<&EntityDescriptor> {
        self.positions.get(entity).map(|&idx| &self.entities[idx])
    }

    #[must_use]
    pub fn position(&self, entity: &str) -> Option<usize> {
        self.positions.get(entity).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
