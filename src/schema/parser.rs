//! Schema ingestion.
//!
//! One source text carries both schema blocks and procedure blocks. Four
//! ordered passes: (1) lexical entity parse, creating each physical table
//! as its body closes and setting procedure blocks aside; (2) schema
//! validation; (3) relation synthesis into junction tables and the
//! both-direction registry; (4) orphan-trigger synthesis for owned
//! entities.
//!
//! Header and field-line grammars are nom parsers applied line by line;
//! a line that no parser accepts is a schema error naming the line.

use std::collections::HashSet;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until},
    character::complete::{alpha1, alphanumeric1, char as nom_char, multispace0},
    combinator::{eof, map, opt, recognize},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded},
    IResult,
};
use tracing::{debug, info, warn};

use super::types::{EntityDef, FieldDef, FieldKind, RelationField, SchemaSet};
use crate::dsl::ast::{RawProcedure, SourceLine};
use crate::error::{EngineError, Result};
use crate::storage::StorageAdapter;

/// Product of schema ingestion: the validated schema plus the procedure
/// blocks left for the procedure compiler.
pub struct Ingested {
    pub schema: SchemaSet,
    pub procedures: Vec<RawProcedure>,
}

pub async fn ingest(source: &str, adapter: &mut dyn StorageAdapter) -> Result<Ingested> {
    let (mut schema, procedures) = lexical_pass(source, adapter).await?;
    validate(&schema)?;
    synthesize_relations(&mut schema, adapter).await?;
    synthesize_orphan_triggers(&schema, adapter).await?;
    info!(
        entities = schema.entities().len(),
        relations = schema.relations.len() / 2,
        procedures = procedures.len(),
        "schema ingested"
    );
    Ok(Ingested { schema, procedures })
}

// ----------------------------------------------------------------------
// Pass 1 — lexical entity parse
// ----------------------------------------------------------------------

struct EntityBuilder {
    def: EntityDef,
    header_line: usize,
}

async fn lexical_pass(
    source: &str,
    adapter: &mut dyn StorageAdapter,
) -> Result<(SchemaSet, Vec<RawProcedure>)> {
    let mut schema = SchemaSet::default();
    let mut procedures: Vec<RawProcedure> = Vec::new();
    let mut entity: Option<EntityBuilder> = None;
    let mut procedure: Option<RawProcedure> = None;

    for (idx, raw_line) in source.lines().enumerate() {
        let number = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
            continue;
        }
        let indent = indent_width(raw_line);

        if procedure.is_some() {
            if indent > 0 {
                procedure.as_mut().unwrap().lines.push(SourceLine {
                    number,
                    indent,
                    text: trimmed.to_string(),
                });
                continue;
            }
            // Back at column zero: the procedure body is complete.
            procedures.push(procedure.take().unwrap());
        }

        if entity.is_some() {
            if trimmed == "}" {
                let builder = entity.take().unwrap();
                debug!(entity = %builder.def.name, fields = builder.def.fields.len(), "entity parsed");
                adapter.ensure_table(&builder.def.name, &builder.def).await?;
                schema.insert(builder.def)?;
            } else {
                parse_field_line(trimmed, number, &mut entity.as_mut().unwrap().def)?;
            }
            continue;
        }

        if let Some((name, owners)) = entity_header(trimmed) {
            entity = Some(EntityBuilder {
                def: EntityDef {
                    name,
                    fields: Vec::new(),
                    relations: Vec::new(),
                    owners,
                },
                header_line: number,
            });
            continue;
        }

        if let Some((name, params_raw)) = procedure_header(trimmed) {
            procedure = Some(RawProcedure {
                name,
                params_raw,
                header_line: number,
                lines: Vec::new(),
            });
            continue;
        }

        return Err(EngineError::Schema(format!(
            "line {number}: unrecognized top-level line '{trimmed}'"
        )));
    }

    if let Some(builder) = entity {
        return Err(EngineError::Schema(format!(
            "entity '{}' (line {}) has no closing '}}'",
            builder.def.name, builder.header_line
        )));
    }
    if let Some(proc_block) = procedure {
        procedures.push(proc_block);
    }
    Ok((schema, procedures))
}

/// Leading whitespace width; tabs count as four columns.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

// ----------------------------------------------------------------------
// Line grammars (nom)
// ----------------------------------------------------------------------

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// An identifier with an optional `[...]` size/spec suffix, e.g.
/// `number[10.2]` or `str[50]`.
fn type_token(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        identifier,
        opt(delimited(nom_char('['), take_until("]"), nom_char(']'))),
    ))(input)
}

fn attribute(input: &str) -> IResult<&str, &str> {
    delimited(nom_char('['), take_until("]"), nom_char(']'))(input)
}

fn default_clause(input: &str) -> IResult<&str, &str> {
    delimited(nom_char('('), take_until(")"), nom_char(')'))(input)
}

/// `Name {` or `Name (Owner1, Owner2) {`
fn entity_header_line(input: &str) -> IResult<&str, (String, Vec<String>)> {
    let (input, name) = preceded(multispace0, identifier)(input)?;
    let (input, owners) = opt(preceded(
        multispace0,
        delimited(
            nom_char('('),
            separated_list0(
                nom_char(','),
                map(delimited(multispace0, identifier, multispace0), str::to_string),
            ),
            nom_char(')'),
        ),
    ))(input)?;
    let (input, _) = preceded(multispace0, nom_char('{'))(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((input, (name.to_string(), owners.unwrap_or_default())))
}

fn entity_header(line: &str) -> Option<(String, Vec<String>)> {
    entity_header_line(line).ok().map(|(_, header)| header)
}

/// `Name(params):` — the raw parameter text is handed to the procedure
/// compiler untouched.
fn procedure_header_line(input: &str) -> IResult<&str, (String, String)> {
    let (input, name) = preceded(multispace0, identifier)(input)?;
    let (input, params) = delimited(nom_char('('), take_until("):"), tag("):"))(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((input, (name.to_string(), params.to_string())))
}

fn procedure_header(line: &str) -> Option<(String, String)> {
    procedure_header_line(line).ok().map(|(_, header)| header)
}

enum ParsedLine<'a> {
    Relation {
        target: &'a str,
        name: &'a str,
    },
    Scalar {
        type_tok: &'a str,
        name: &'a str,
        attributes: Vec<&'a str>,
        default: Option<&'a str>,
    },
}

/// `List[Target]:name`
fn relation_field(input: &str) -> IResult<&str, ParsedLine<'_>> {
    let (input, _) = tag_no_case("list")(input)?;
    let (input, target) = delimited(nom_char('['), take_until("]"), nom_char(']'))(input)?;
    let (input, name) = preceded(nom_char(':'), identifier)(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((input, ParsedLine::Relation { target, name }))
}

/// `TYPE:name [attribute]* (default)?`
fn scalar_field(input: &str) -> IResult<&str, ParsedLine<'_>> {
    let (input, type_tok) = type_token(input)?;
    let (input, name) = preceded(nom_char(':'), identifier)(input)?;
    let (input, attributes) = many0(preceded(multispace0, attribute))(input)?;
    let (input, default) = opt(preceded(multispace0, default_clause))(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((
        input,
        ParsedLine::Scalar {
            type_tok,
            name,
            attributes,
            default,
        },
    ))
}

fn field_line(input: &str) -> IResult<&str, ParsedLine<'_>> {
    preceded(multispace0, alt((relation_field, scalar_field)))(input)
}

fn parse_field_line(line: &str, number: usize, def: &mut EntityDef) -> Result<()> {
    let (_, parsed) = field_line(line).map_err(|_| {
        EngineError::Schema(format!("line {number}: malformed field line '{line}'"))
    })?;
    match parsed {
        ParsedLine::Relation { target, name } => {
            let target = target.trim();
            if target.is_empty() {
                return Err(EngineError::Schema(format!(
                    "line {number}: relation '{line}' names no target entity"
                )));
            }
            def.relations.push(RelationField {
                field_name: name.to_string(),
                target: target.to_string(),
            });
        }
        ParsedLine::Scalar {
            type_tok,
            name,
            attributes,
            default,
        } => {
            let kind = FieldKind::parse(type_tok)
                .map_err(|e| EngineError::Schema(format!("line {number}: {e}")))?;
            let mut primary = false;
            let mut not_null = false;
            let mut unique = false;
            for attr in attributes {
                match attr.trim() {
                    "primary" => primary = true,
                    "not null" => not_null = true,
                    "unique" => unique = true,
                    other => {
                        return Err(EngineError::Schema(format!(
                            "line {number}: unknown attribute '[{other}]'"
                        )))
                    }
                }
            }
            def.fields.push(FieldDef {
                name: name.to_string(),
                raw_type: type_tok.to_string(),
                kind,
                primary,
                not_null,
                unique,
                default_value: default.map(|d| d.trim().to_string()),
            });
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Pass 2 — schema validation
// ----------------------------------------------------------------------

fn validate(schema: &SchemaSet) -> Result<()> {
    for def in schema.entities() {
        let primaries: Vec<_> = def.fields.iter().filter(|f| f.primary).collect();
        if primaries.len() > 1 {
            return Err(EngineError::Schema(format!(
                "entity '{}' declares more than one [primary] field ('{}' and '{}')",
                def.name, primaries[0].name, primaries[1].name
            )));
        }
        for relation in &def.relations {
            if schema.entity(&relation.target).is_none() {
                return Err(EngineError::Schema(format!(
                    "entity '{}': relation '{}' targets unknown entity '{}'",
                    def.name, relation.field_name, relation.target
                )));
            }
        }
        for owner in &def.owners {
            let owner_def = schema.entity(owner).ok_or_else(|| {
                EngineError::Schema(format!(
                    "entity '{}': unknown owner '{}'",
                    def.name, owner
                ))
            })?;
            let linked = def
                .relations
                .iter()
                .any(|r| r.target.eq_ignore_ascii_case(owner))
                || owner_def
                    .relations
                    .iter()
                    .any(|r| r.target.eq_ignore_ascii_case(&def.name));
            if !linked {
                warn!(
                    entity = %def.name,
                    owner = %owner_def.name,
                    "owner declared without a linking relation; orphan removal will not cover it"
                );
            }
        }
        if def.is_owned() && def.primary_field().is_none() {
            return Err(EngineError::Schema(format!(
                "owned entity '{}' needs a [primary] field",
                def.name
            )));
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Pass 3 — relation synthesis
// ----------------------------------------------------------------------

async fn synthesize_relations(
    schema: &mut SchemaSet,
    adapter: &mut dyn StorageAdapter,
) -> Result<()> {
    let mut seen_tables = HashSet::new();
    // Collect first: the registry borrows the entity list mutably.
    let pairs: Vec<(String, String)> = schema
        .entities()
        .iter()
        .flat_map(|def| {
            def.relations
                .iter()
                .map(|r| (def.name.clone(), r.target.clone()))
        })
        .collect();

    for (source, target) in pairs {
        let source_def = schema
            .entity(&source)
            .expect("validated in pass 2")
            .clone();
        let target_def = schema
            .entity(&target)
            .expect("validated in pass 2")
            .clone();
        let (table, _, _) = schema.relations.register(&source_def, &target_def)?;
        if seen_tables.insert(table.clone()) {
            let pk1 = source_def.primary_field().expect("register checked").name.clone();
            let pk2 = target_def.primary_field().expect("register checked").name.clone();
            adapter
                .ensure_relation_table(&source_def.name, &target_def.name, &pk1, &pk2)
                .await?;
            debug!(table = %table, "junction table synthesized");
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Pass 4 — orphan-trigger synthesis
// ----------------------------------------------------------------------

async fn synthesize_orphan_triggers(
    schema: &SchemaSet,
    adapter: &mut dyn StorageAdapter,
) -> Result<()> {
    for def in schema.entities() {
        if !def.is_owned() {
            continue;
        }
        let pk = def
            .primary_field()
            .expect("validated in pass 2")
            .name
            .clone();

        // One check per owner junction; every trigger body carries ALL of
        // them, so the owned row survives until the last link drops.
        let all_checks: Vec<(String, String)> = def
            .owners
            .iter()
            .filter_map(|owner| schema.relations.lookup(owner, &def.name))
            .map(|entry| (entry.table.clone(), entry.target_col.clone()))
            .collect();
        if all_checks.is_empty() {
            warn!(entity = %def.name, "owned entity has no owner junctions; skipping orphan triggers");
            continue;
        }

        for (trigger_table, target_id_col) in &all_checks {
            adapter
                .ensure_orphan_trigger(&def.name, &pk, trigger_table, target_id_col, &all_checks)
                .await?;
        }
        debug!(entity = %def.name, triggers = all_checks.len(), "orphan triggers synthesized");
    }
    Ok(())
}
