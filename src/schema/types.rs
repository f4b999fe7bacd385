//! Declared schema: entities, fields, relations, and the relation registry.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::value::{self, Value};

/// The declared kind of a column, with its constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Number {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Text {
        max_length: Option<usize>,
    },
    Bool,
    DateTime,
}

impl FieldKind {
    /// Parse a raw type token: `number`, `number[10]`, `number[10.2]`,
    /// `str`, `str[50]`, `bool`, `datetime`. Case-insensitive.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (base, bracket) = match raw.find('[') {
            Some(i) => {
                let close = raw
                    .rfind(']')
                    .ok_or_else(|| EngineError::Schema(format!("unclosed bracket in type '{raw}'")))?;
                (&raw[..i], Some(&raw[i + 1..close]))
            }
            None => (raw, None),
        };
        match base.to_ascii_lowercase().as_str() {
            "number" => {
                let (precision, scale) = match bracket {
                    None => (None, None),
                    Some(spec) => match spec.split_once('.') {
                        Some((p, s)) => (
                            Some(parse_cap(p, raw)?),
                            Some(parse_cap(s, raw)?),
                        ),
                        None => (Some(parse_cap(spec, raw)?), None),
                    },
                };
                if let (Some(p), Some(s)) = (precision, scale) {
                    if s > p {
                        return Err(EngineError::Schema(format!(
                            "scale exceeds precision in type '{raw}'"
                        )));
                    }
                }
                Ok(Self::Number { precision, scale })
            }
            "str" => {
                let max_length = match bracket {
                    None => None,
                    Some(spec) => Some(parse_cap(spec, raw)? as usize),
                };
                Ok(Self::Text { max_length })
            }
            "bool" => Ok(Self::Bool),
            "datetime" => Ok(Self::DateTime),
            other => Err(EngineError::Schema(format!("unknown type '{other}'"))),
        }
    }

    /// Wrap a raw scalar as a typed value under this kind's constraints.
    pub fn wrap_raw(&self, raw: &JsonValue) -> Result<Value> {
        match self {
            Self::Number { precision, scale } => value::number_from_raw(raw, *precision, *scale),
            Self::Text { max_length } => value::text_from_raw(raw, *max_length),
            Self::Bool => value::bool_from_raw(raw),
            Self::DateTime => value::datetime_from_raw(raw),
        }
    }

    /// Parse a textual literal (a default value, or a procedure argument
    /// arriving as text) into a typed value.
    pub fn parse_literal(&self, text: &str) -> Result<Value> {
        self.wrap_raw(&JsonValue::String(text.to_string()))
    }

    /// SQL storage class on the relational back end. Decimals and datetimes
    /// persist as text for exact fidelity.
    pub fn column_type(&self) -> &'static str {
        match self {
            Self::Number { .. } | Self::Text { .. } | Self::DateTime => "TEXT",
            Self::Bool => "INTEGER",
        }
    }
}

fn parse_cap(s: &str, raw: &str) -> Result<u32> {
    s.trim()
        .parse()
        .map_err(|_| EngineError::Schema(format!("invalid size in type '{raw}'")))
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// The type token exactly as declared, for diagnostics and the snapshot
    /// schema echo.
    pub raw_type: String,
    pub kind: FieldKind,
    pub primary: bool,
    pub not_null: bool,
    pub unique: bool,
    /// Textual default, parsed lazily at the point of use.
    pub default_value: Option<String>,
}

/// One declared many-to-many relation slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationField {
    pub field_name: String,
    pub target: String,
}

/// One declared entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationField>,
    /// Non-empty makes this an owned entity, reclaimed when the last
    /// owner-link is dropped.
    pub owners: Vec<String>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.primary)
    }

    pub fn relation(&self, field_name: &str) -> Option<&RelationField> {
        self.relations.iter().find(|r| r.field_name == field_name)
    }

    pub fn is_owned(&self) -> bool {
        !self.owners.is_empty()
    }
}

/// One direction of a synthesized relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEntry {
    /// Lowercased source entity name.
    pub source: String,
    /// Lowercased target entity name.
    pub target: String,
    pub table: String,
    /// Junction column holding the source row's primary key.
    pub source_col: String,
    /// Junction column holding the target row's primary key.
    pub target_col: String,
}

/// Both-direction lookup over synthesized junction tables.
#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    entries: HashMap<(String, String), RelationEntry>,
}

impl RelationRegistry {
    /// Register both directions of a relation between `a` and `b`.
    pub fn register(&mut self, a: &EntityDef, b: &EntityDef) -> Result<(String, String, String)> {
        let (first, second) = junction_order(a, b);
        let first_pk = required_pk(first)?;
        let second_pk = required_pk(second)?;
        let table = junction_table_name(&first.name, &second.name);
        let first_col = junction_column(&first.name, first_pk);
        let second_col = junction_column(&second.name, second_pk);

        for (src, dst, src_col, dst_col) in [
            (first, second, &first_col, &second_col),
            (second, first, &second_col, &first_col),
        ] {
            self.entries.insert(
                (src.name.to_lowercase(), dst.name.to_lowercase()),
                RelationEntry {
                    source: src.name.to_lowercase(),
                    target: dst.name.to_lowercase(),
                    table: table.clone(),
                    source_col: src_col.clone(),
                    target_col: dst_col.clone(),
                },
            );
        }
        Ok((table, first_col, second_col))
    }

    pub fn lookup(&self, source: &str, target: &str) -> Option<&RelationEntry> {
        self.entries
            .get(&(source.to_lowercase(), target.to_lowercase()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Case-insensitive lexicographic ordering of the entity pair; every
/// physical junction artifact derives from this order, so declaring the
/// relation on either side yields the same schema.
pub fn junction_order<'a>(a: &'a EntityDef, b: &'a EntityDef) -> (&'a EntityDef, &'a EntityDef) {
    if a.name.to_lowercase() <= b.name.to_lowercase() {
        (a, b)
    } else {
        (b, a)
    }
}

pub fn junction_table_name(e1: &str, e2: &str) -> String {
    let (a, b) = {
        let (la, lb) = (e1.to_lowercase(), e2.to_lowercase());
        if la <= lb {
            (la, lb)
        } else {
            (lb, la)
        }
    };
    format!("{a}_{b}")
}

pub fn junction_column(entity: &str, pk: &FieldDef) -> String {
    format!("{}_{}", entity.to_lowercase(), pk.name)
}

fn required_pk(def: &EntityDef) -> Result<&FieldDef> {
    def.primary_field().ok_or_else(|| {
        EngineError::Schema(format!(
            "entity '{}' needs a [primary] field to take part in a relation",
            def.name
        ))
    })
}

/// The immutable product of schema ingestion.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    entities: Vec<EntityDef>,
    by_name: HashMap<String, usize>,
    pub relations: RelationRegistry,
}

impl SchemaSet {
    pub fn insert(&mut self, def: EntityDef) -> Result<()> {
        let key = def.name.to_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(EngineError::Schema(format!(
                "duplicate entity name '{}'",
                def.name
            )));
        }
        self.by_name.insert(key, self.entities.len());
        self.entities.push(def);
        Ok(())
    }

    /// Case-insensitive lookup.
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|&i| &self.entities[i])
    }

    /// Lookup that additionally trims one trailing `s` — the documented
    /// pluralization heuristic of the procedure grammar.
    pub fn entity_singular(&self, name: &str) -> Option<&EntityDef> {
        self.entity(name).or_else(|| {
            name.strip_suffix('s')
                .or_else(|| name.strip_suffix('S'))
                .and_then(|trimmed| self.entity(trimmed))
        })
    }

    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entity(name: &str, pk: &str) -> EntityDef {
        EntityDef {
            name: name.to_string(),
            fields: vec![FieldDef {
                name: pk.to_string(),
                raw_type: "number".into(),
                kind: FieldKind::Number {
                    precision: None,
                    scale: None,
                },
                primary: true,
                not_null: false,
                unique: false,
                default_value: None,
            }],
            relations: vec![],
            owners: vec![],
        }
    }

    #[test]
    fn parse_type_tokens() {
        assert_eq!(
            FieldKind::parse("number[10.2]").unwrap(),
            FieldKind::Number {
                precision: Some(10),
                scale: Some(2)
            }
        );
        assert_eq!(
            FieldKind::parse("STR[50]").unwrap(),
            FieldKind::Text {
                max_length: Some(50)
            }
        );
        assert_eq!(FieldKind::parse("Bool").unwrap(), FieldKind::Bool);
        assert_eq!(FieldKind::parse("DateTime").unwrap(), FieldKind::DateTime);
        assert!(FieldKind::parse("number[2.5").is_err());
        assert!(FieldKind::parse("number[2.5]").is_ok());
        assert!(FieldKind::parse("number[1.5]").is_err()); // scale > precision
        assert!(FieldKind::parse("blob").is_err());
    }

    #[test]
    fn junction_naming_is_order_independent() {
        let user = entity("User", "id");
        let post = entity("Post", "id");
        let reg_a = {
            let mut r = RelationRegistry::default();
            r.register(&user, &post).unwrap()
        };
        let reg_b = {
            let mut r = RelationRegistry::default();
            r.register(&post, &user).unwrap()
        };
        assert_eq!(reg_a, reg_b);
        assert_eq!(reg_a.0, "post_user");
        assert_eq!(reg_a.1, "post_id");
        assert_eq!(reg_a.2, "user_id");
    }

    #[test]
    fn registry_exposes_both_directions() {
        let user = entity("User", "id");
        let post = entity("Post", "id");
        let mut reg = RelationRegistry::default();
        reg.register(&user, &post).unwrap();

        let from_user = reg.lookup("user", "post").unwrap();
        assert_eq!(from_user.source_col, "user_id");
        assert_eq!(from_user.target_col, "post_id");

        let from_post = reg.lookup("Post", "User").unwrap();
        assert_eq!(from_post.source_col, "post_id");
        assert_eq!(from_post.target_col, "user_id");
        assert_eq!(from_post.table, "post_user");
    }

    #[test]
    fn schema_set_rejects_duplicates_and_trims_plural() {
        let mut set = SchemaSet::default();
        set.insert(entity("Item", "id")).unwrap();
        assert!(set.insert(entity("ITEM", "id")).is_err());
        assert!(set.entity("item").is_some());
        assert!(set.entity_singular("Items").is_some());
        assert!(set.entity_singular("Widgets").is_none());
    }
}
