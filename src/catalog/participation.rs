//! The participation-tracking domain catalog.

use super::{CatalogError, EntityCatalog, EntityDescriptor, FieldKind};

/// Catalog of every entity the participation tracker replicates, in
/// dependency order.
///
/// # Errors
///
/// Only fails if the declaration below is edited into an invalid order; call
/// it once at startup so that mistake surfaces immediately.
pub fn participation() -> Result<EntityCatalog, CatalogError> {
    use FieldKind::{Boolean, Integer, Real, Text, Timestamp};

    EntityCatalog::new(vec![
        EntityDescriptor::new("Institution", "institutions")
            .field("name", Text)
            .field("kind", Text)
            .optional("address", Text)
            .optional("phone", Text)
            .optional("created_at", Timestamp),
        EntityDescriptor::new("Level", "levels")
            .foreign_key("institution_id", "Institution")
            .field("name", Text)
            .optional("description", Text)
            .optional("position", Integer)
            .optional("created_at", Timestamp),
        EntityDescriptor::new("Section", "sections")
            .foreign_key("level_id", "Level")
            .field("name", Text)
            .optional("max_capacity", Integer)
            .optional("created_at", Timestamp),
        EntityDescriptor::new("Teacher", "teachers")
            .field("name", Text)
            .unique("email", Text)
            .field("password_hash", Text)
            .field("is_admin", Boolean)
            .field("active", Boolean)
            .optional("created_at", Timestamp)
            .optional("updated_at", Timestamp),
        EntityDescriptor::new("Class", "classes")
            .foreign_key("teacher_id", "Teacher")
            .foreign_key("section_id", "Section")
            .field("name", Text)
            .optional("description", Text)
            .field("academic_year", Integer)
            .field("active", Boolean)
            .optional("created_at", Timestamp)
            .optional("updated_at", Timestamp),
        EntityDescriptor::new("Student", "students")
            .foreign_key("class_id", "Class")
            .field("name", Text)
            .field("roll_number", Integer)
            .field("active", Boolean)
            .optional("created_at", Timestamp)
            .optional("updated_at", Timestamp),
        EntityDescriptor::new("Participation", "participations")
            .foreign_key("student_id", "Student")
            .field("points", Real)
            .optional("recorded_at", Timestamp)
            .optional("description", Text)
            .optional("kind", Text),
    ])
}
