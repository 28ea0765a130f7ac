//! Entity payloads: a tagged union keyed by entity name.
//!
//! The queue treats field contents as opaque; it only checks the *shape*
//! (an object, no identity fields the queue owns) and rewrites temp-id
//! references once the referenced entity has a server id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stowage_core::{DomainError, DomainResult};

use crate::types::{EntityKind, Operation};

/// Keys owned by the client and backend, never by a payload.
pub const RESERVED_FIELDS: [&str; 2] = ["id", "_pending"];

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "fields", rename_all = "snake_case")]
pub enum EntityPayload {
    Item(Fields),
    Location(Fields),
    Container(Fields),
    Category(Fields),
    Loan(Fields),
    Member(Fields),
}

impl EntityPayload {
    /// Build a payload from a JSON document, which must be an object.
    pub fn new(kind: EntityKind, document: Value) -> DomainResult<Self> {
        let Value::Object(fields) = document else {
            return Err(DomainError::validation(format!(
                "{kind} payload must be a JSON object"
            )));
        };
        Ok(Self::from_fields(kind, fields))
    }

    pub fn from_fields(kind: EntityKind, fields: Fields) -> Self {
        match kind {
            EntityKind::Item => EntityPayload::Item(fields),
            EntityKind::Location => EntityPayload::Location(fields),
            EntityKind::Container => EntityPayload::Container(fields),
            EntityKind::Category => EntityPayload::Category(fields),
            EntityKind::Loan => EntityPayload::Loan(fields),
            EntityKind::Member => EntityPayload::Member(fields),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Item(_) => EntityKind::Item,
            EntityPayload::Location(_) => EntityKind::Location,
            EntityPayload::Container(_) => EntityKind::Container,
            EntityPayload::Category(_) => EntityKind::Category,
            EntityPayload::Loan(_) => EntityKind::Loan,
            EntityPayload::Member(_) => EntityKind::Member,
        }
    }

    pub fn fields(&self) -> &Fields {
        match self {
            EntityPayload::Item(f)
            | EntityPayload::Location(f)
            | EntityPayload::Container(f)
            | EntityPayload::Category(f)
            | EntityPayload::Loan(f)
            | EntityPayload::Member(f) => f,
        }
    }

    fn fields_mut(&mut self) -> &mut Fields {
        match self {
            EntityPayload::Item(f)
            | EntityPayload::Location(f)
            | EntityPayload::Container(f)
            | EntityPayload::Category(f)
            | EntityPayload::Loan(f)
            | EntityPayload::Member(f) => f,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields().clone())
    }

    /// Shape checks applied when a mutation is enqueued.
    pub fn validate(&self, entity: EntityKind, operation: Operation) -> DomainResult<()> {
        if self.kind() != entity {
            return Err(DomainError::validation(format!(
                "payload is tagged '{}' but the mutation targets '{}'",
                self.kind(),
                entity
            )));
        }
        if let Some(reserved) = RESERVED_FIELDS
            .iter()
            .find(|f| self.fields().contains_key(**f))
        {
            return Err(DomainError::validation(format!(
                "field '{reserved}' is managed by the client and cannot be set"
            )));
        }
        if self.fields().keys().any(|k| k.trim().is_empty()) {
            return Err(DomainError::validation("payload contains an empty field name"));
        }
        if operation == Operation::Create && self.fields().is_empty() {
            return Err(DomainError::validation(format!("empty {entity} create payload")));
        }
        Ok(())
    }

    /// Does any field (at any depth) hold exactly `id`?
    pub fn references(&self, id: &str) -> bool {
        self.fields().values().any(|v| value_references(v, id))
    }

    /// String values found anywhere in the payload, for temp-id scanning.
    pub fn string_values(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for v in self.fields().values() {
            collect_strings(v, &mut out);
        }
        out
    }

    /// Replace every string equal to `from` with `to`. Returns whether
    /// anything changed.
    pub fn substitute(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for v in self.fields_mut().values_mut() {
            changed |= substitute_value(v, from, to);
        }
        changed
    }
}

fn value_references(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Array(items) => items.iter().any(|v| value_references(v, id)),
        Value::Object(map) => map.values().any(|v| value_references(v, id)),
        _ => false,
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn substitute_value(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, v| substitute_value(v, from, to) | acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, v| substitute_value(v, from, to) | acc),
        _ => false,
    }
}
