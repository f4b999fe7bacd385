//! Procedure execution.
//!
//! Each invocation builds a fresh scope, opens an adapter transaction,
//! walks the statement tree, and commits on success. Any error unwinds to
//! the procedure boundary, which rolls back and re-raises. `return` inside
//! nested blocks travels as an explicit sentinel (`Flow::Returned`) checked
//! by every block handler, never as an error.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ast::{Condition, Expr, ExprTok, BinOp, Node, Param, ParamKind, ProcedureDef, Statement};
use crate::entity::{shared_to_tree, Entity, RelationList, RelationLoader, SharedEntity};
use crate::error::{EngineError, Result};
use crate::schema::types::{EntityDef, SchemaSet};
use crate::storage::{RawRecord, StorageAdapter};
use crate::value::Value;

/// One binding in a procedure scope.
#[derive(Clone)]
pub enum Slot {
    Value(Value),
    Entity(SharedEntity),
    List(Vec<Slot>),
    Null,
}

type Scope = HashMap<String, Slot>;

/// Statement walk outcome: fall through, or a `return` propagating out of
/// every enclosing block.
enum Flow {
    Normal,
    Returned(JsonValue),
}

/// Relation loader over the junction tables. Every loaded target entity
/// receives an equivalent loader, so traversal is transitive.
struct JunctionLoader {
    adapter: Arc<Mutex<dyn StorageAdapter>>,
    schema: Arc<SchemaSet>,
}

#[async_trait::async_trait]
impl RelationLoader for JunctionLoader {
    async fn load(&self, source: &EntityDef, field: &str, pk: &JsonValue) -> Result<RelationList> {
        let relation = source.relation(field).ok_or_else(|| {
            EngineError::Resolution(format!(
                "entity '{}' has no relation '{}'",
                source.name, field
            ))
        })?;
        let target_def = self.schema.entity(&relation.target).ok_or_else(|| {
            EngineError::Resolution(format!("unknown entity '{}'", relation.target))
        })?;
        let entry = self
            .schema
            .relations
            .lookup(&source.name, &target_def.name)
            .ok_or_else(|| {
                EngineError::Resolution(format!(
                    "no junction registered between '{}' and '{}'",
                    source.name, target_def.name
                ))
            })?;
        let target_pk = target_def.primary_field().ok_or_else(|| {
            EngineError::Schema(format!("entity '{}' has no [primary] field", target_def.name))
        })?;

        let mut criteria = RawRecord::new();
        criteria.insert(entry.source_col.clone(), pk.clone());
        let links = self.adapter.lock().await.find(&entry.table, &criteria).await?;
        debug!(
            table = %entry.table,
            links = links.len(),
            "relation '{}' of '{}' loaded", field, source.name
        );

        let target_arc = Arc::new(target_def.clone());
        let mut out = Vec::new();
        for link in links {
            let target_id = link.get(&entry.target_col).cloned().unwrap_or(JsonValue::Null);
            if target_id.is_null() {
                continue;
            }
            let mut row_criteria = RawRecord::new();
            row_criteria.insert(target_pk.name.clone(), target_id);
            let row = self
                .adapter
                .lock()
                .await
                .find_one(&target_def.name, &row_criteria)
                .await?;
            if let Some(row) = row {
                let child_loader: Arc<dyn RelationLoader> = Arc::new(JunctionLoader {
                    adapter: self.adapter.clone(),
                    schema: self.schema.clone(),
                });
                out.push(Entity::new(target_arc.clone(), row, Some(child_loader)).into_shared());
            }
        }
        Ok(Some(out))
    }
}

/// Executes compiled procedures against one adapter.
pub struct Executor {
    adapter: Arc<Mutex<dyn StorageAdapter>>,
    schema: Arc<SchemaSet>,
}

impl Executor {
    pub fn new(adapter: Arc<Mutex<dyn StorageAdapter>>, schema: Arc<SchemaSet>) -> Self {
        Self { adapter, schema }
    }

    fn loader(&self) -> Arc<dyn RelationLoader> {
        Arc::new(JunctionLoader {
            adapter: self.adapter.clone(),
            schema: self.schema.clone(),
        })
    }

    /// Run one procedure as one transaction.
    pub async fn invoke(
        &self,
        def: &ProcedureDef,
        args: &serde_json::Map<String, JsonValue>,
    ) -> Result<JsonValue> {
        let mut scope = self.build_scope(&def.params, args)?;
        self.adapter.lock().await.begin_transaction().await?;
        debug!(procedure = %def.name, "transaction begun");

        match self.exec_block(&def.body, &mut scope).await {
            Ok(flow) => {
                self.adapter.lock().await.commit().await?;
                debug!(procedure = %def.name, "committed");
                Ok(match flow {
                    Flow::Returned(value) => value,
                    Flow::Normal => JsonValue::Null,
                })
            }
            Err(e) => {
                if let Err(rb) = self.adapter.lock().await.rollback().await {
                    warn!(procedure = %def.name, error = %rb, "rollback after failure also failed");
                }
                debug!(procedure = %def.name, error = %e, "rolled back");
                Err(e)
            }
        }
    }

    fn build_scope(
        &self,
        params: &[Param],
        args: &serde_json::Map<String, JsonValue>,
    ) -> Result<Scope> {
        let mut scope = Scope::new();
        for param in params {
            let slot = match args.get(&param.name) {
                Some(raw) => wrap_argument(param, raw)?,
                None => match (&param.kind, &param.default) {
                    (ParamKind::List(_), _) => {
                        return Err(EngineError::Resolution(format!(
                            "missing list argument '{}'",
                            param.name
                        )))
                    }
                    (ParamKind::Scalar(kind), Some(default)) => {
                        Slot::Value(kind.parse_literal(default)?)
                    }
                    (ParamKind::Scalar(_), None) => Slot::Null,
                },
            };
            scope.insert(param.name.clone(), slot);
        }
        Ok(scope)
    }

    fn exec_block<'a>(
        &'a self,
        body: &'a [Statement],
        scope: &'a mut Scope,
    ) -> BoxFuture<'a, Result<Flow>> {
        async move {
            for stmt in body {
                match self.exec_statement(stmt, scope).await? {
                    Flow::Normal => {}
                    returned => return Ok(returned),
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    async fn exec_statement(&self, stmt: &Statement, scope: &mut Scope) -> Result<Flow> {
        match &stmt.node {
            Node::Get { entity, id, alias } => {
                self.exec_get(entity, id, alias, scope).await?;
                Ok(Flow::Normal)
            }
            Node::Create {
                entity,
                assignments,
                alias,
            } => {
                self.exec_create(entity, assignments, alias.as_deref(), scope)
                    .await?;
                Ok(Flow::Normal)
            }
            Node::Update { alias, assignments } => {
                self.exec_update(alias, assignments, scope).await?;
                Ok(Flow::Normal)
            }
            Node::Set { var, expr } => {
                let slot = self.eval_expr(expr, scope).await?;
                scope.insert(var.clone(), slot);
                Ok(Flow::Normal)
            }
            Node::If { cond, body } => {
                if self.eval_condition(cond, scope).await? {
                    self.exec_block(body, scope).await
                } else {
                    Ok(Flow::Normal)
                }
            }
            Node::ForEach { item, list, body } => self.exec_for_each(item, list, body, scope).await,
            Node::Return { expr } => {
                let value = match expr {
                    None => JsonValue::Null,
                    Some(expr) => {
                        let slot = self.eval_expr(expr, scope).await?;
                        serialize_slot(&slot).await
                    }
                };
                Ok(Flow::Returned(value))
            }
            Node::Raw { text } => {
                // Escape hatch: evaluate as a bare expression, discard the
                // result. Unresolvable references still abort the procedure.
                let expr = Expr::parse(text)?;
                self.eval_expr(&expr, scope).await?;
                Ok(Flow::Normal)
            }
        }
    }

    async fn exec_get(
        &self,
        entity: &str,
        id: &Expr,
        alias: &str,
        scope: &mut Scope,
    ) -> Result<()> {
        let def = self.entity_def(entity)?;
        let pk = def.primary_field().ok_or_else(|| {
            EngineError::Resolution(format!("entity '{}' has no [primary] field", def.name))
        })?;
        let id_value = self.eval_value(id, scope).await?;
        let id_raw = pk.kind.wrap_raw(&id_value.to_raw())?.to_raw();

        let mut criteria = RawRecord::new();
        criteria.insert(pk.name.clone(), id_raw);
        let row = self.adapter.lock().await.find_one(&def.name, &criteria).await?;
        match row {
            Some(row) => {
                let shared = Entity::new(Arc::new(def.clone()), row, Some(self.loader())).into_shared();
                scope.insert(alias.to_string(), Slot::Entity(shared));
            }
            None => {
                debug!(entity = %def.name, "no row matched; alias bound to null");
                scope.insert(alias.to_string(), Slot::Null);
            }
        }
        Ok(())
    }

    async fn exec_create(
        &self,
        entity: &str,
        assignments: &[(String, Expr)],
        alias: Option<&str>,
        scope: &mut Scope,
    ) -> Result<()> {
        let def = self.entity_def(entity)?;
        let mut record = RawRecord::new();
        for (field, expr) in assignments {
            let field_def = def.field(field).ok_or_else(|| {
                EngineError::Resolution(format!(
                    "entity '{}' has no field '{}'",
                    def.name, field
                ))
            })?;
            let value = self.eval_value(expr, scope).await?;
            let raw = field_def.kind.wrap_raw(&value.to_raw())?.to_raw();
            record.insert(field.clone(), raw);
        }
        // Declared defaults fill whatever the statement leaves unset.
        for field in &def.fields {
            if record.contains_key(&field.name) {
                continue;
            }
            if let Some(default) = &field.default_value {
                record.insert(field.name.clone(), field.kind.parse_literal(default)?.to_raw());
            }
        }
        self.adapter.lock().await.insert(&def.name, &record).await?;
        debug!(entity = %def.name, "row created");
        if let Some(alias) = alias {
            let shared = Entity::new(Arc::new(def.clone()), record, Some(self.loader())).into_shared();
            scope.insert(alias.to_string(), Slot::Entity(shared));
        }
        Ok(())
    }

    async fn exec_update(
        &self,
        alias: &str,
        assignments: &[(String, Expr)],
        scope: &mut Scope,
    ) -> Result<()> {
        let shared = match scope.get(alias) {
            Some(Slot::Entity(shared)) => shared.clone(),
            Some(_) => {
                return Err(EngineError::Resolution(format!(
                    "'{alias}' is not an entity"
                )))
            }
            None => {
                return Err(EngineError::Resolution(format!(
                    "unknown alias '{alias}'"
                )))
            }
        };

        // Evaluate all right-hand sides before taking the write lock; the
        // expressions may read fields of this same entity.
        let mut evaluated = Vec::with_capacity(assignments.len());
        for (field, expr) in assignments {
            evaluated.push((field.clone(), self.eval_value(expr, scope).await?));
        }

        // In-memory and persisted state move in lock-step so later reads in
        // this procedure see the new values.
        let (entity_name, criteria, updates) = {
            let mut guard = shared.write().await;
            let pk = guard.def().primary_field().ok_or_else(|| {
                EngineError::Resolution(format!(
                    "entity '{}' has no [primary] field",
                    guard.def().name
                ))
            })?;
            let mut criteria = RawRecord::new();
            criteria.insert(pk.name.clone(), guard.pk_raw()?);

            let mut updates = RawRecord::new();
            for (field, value) in &evaluated {
                let raw = guard.set(field, value)?;
                updates.insert(field.clone(), raw);
            }
            (guard.def().name.clone(), criteria, updates)
        };
        self.adapter
            .lock()
            .await
            .update(&entity_name, &criteria, &updates)
            .await?;
        debug!(entity = %entity_name, fields = updates.len(), "row updated");
        Ok(())
    }

    async fn exec_for_each(
        &self,
        item: &str,
        list: &Expr,
        body: &[Statement],
        scope: &mut Scope,
    ) -> Result<Flow> {
        let items = match self.eval_expr(list, scope).await? {
            Slot::List(items) => items,
            // Null or absent iterates zero times.
            Slot::Null => Vec::new(),
            _ => {
                warn!(expr = %list.raw, "'For Each' target is not iterable; loop skipped");
                return Ok(Flow::Normal);
            }
        };
        for slot in items {
            // The loop variable intentionally overwrites (and outlives) any
            // prior binding of the same name.
            scope.insert(item.to_string(), slot);
            match self.exec_block(body, scope).await? {
                Flow::Normal => {}
                returned => return Ok(returned),
            }
        }
        Ok(Flow::Normal)
    }

    fn entity_def(&self, name: &str) -> Result<&EntityDef> {
        self.schema
            .entity_singular(name)
            .ok_or_else(|| EngineError::Resolution(format!("unknown entity '{name}'")))
    }

    // ------------------------------------------------------------------
    // Expressions and conditions
    // ------------------------------------------------------------------

    async fn eval_condition(&self, cond: &Condition, scope: &Scope) -> Result<bool> {
        match cond {
            Condition::Compare { lhs, op, rhs } => {
                let left = self.eval_value(lhs, scope).await?;
                let right = self.eval_value(rhs, scope).await?;
                left.compare(*op, &right)
            }
            Condition::Bare(expr) => match self.eval_expr(expr, scope).await? {
                Slot::Value(Value::Bool(b)) => Ok(b),
                _ => Err(EngineError::Resolution(format!(
                    "condition '{}' is not a boolean",
                    expr.raw
                ))),
            },
        }
    }

    /// Evaluate an expression that must produce a scalar value.
    async fn eval_value(&self, expr: &Expr, scope: &Scope) -> Result<Value> {
        match self.eval_expr(expr, scope).await? {
            Slot::Value(value) => Ok(value),
            Slot::Null => Err(EngineError::Resolution(format!(
                "expression '{}' evaluated to null",
                expr.raw
            ))),
            _ => Err(EngineError::Resolution(format!(
                "expression '{}' is not a scalar",
                expr.raw
            ))),
        }
    }

    /// Postfix stack walk. Binary operators dispatch on the left operand's
    /// kind; both operands are always evaluated.
    async fn eval_expr(&self, expr: &Expr, scope: &Scope) -> Result<Slot> {
        let mut stack: Vec<Slot> = Vec::new();
        for tok in &expr.postfix {
            match tok {
                ExprTok::Number(d) => {
                    stack.push(Slot::Value(Value::number(*d, None, None)?));
                }
                ExprTok::Str(s) => {
                    stack.push(Slot::Value(Value::text(s.clone(), None)?));
                }
                ExprTok::Var(path) => {
                    stack.push(self.resolve_var(path, scope).await?);
                }
                ExprTok::Op(op) => {
                    let rhs = stack.pop();
                    let lhs = stack.pop();
                    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                        return Err(EngineError::Resolution(format!(
                            "unparsable expression '{}'",
                            expr.raw
                        )));
                    };
                    let (lhs, rhs) = (operand(lhs, &expr.raw)?, operand(rhs, &expr.raw)?);
                    let result = match op {
                        BinOp::Add => lhs.add(&rhs)?,
                        BinOp::Sub => lhs.sub(&rhs)?,
                        BinOp::Mul => lhs.mul(&rhs)?,
                        BinOp::Div => lhs.div(&rhs)?,
                    };
                    stack.push(Slot::Value(result));
                }
            }
        }
        match (stack.pop(), stack.is_empty()) {
            (Some(slot), true) => Ok(slot),
            _ => Err(EngineError::Resolution(format!(
                "unparsable expression '{}'",
                expr.raw
            ))),
        }
    }

    /// `{root}` looks up the scope; each further segment resolves through
    /// the entity: scalar fields wrap freshly, relation fields trigger the
    /// lazy loader.
    async fn resolve_var(&self, path: &[String], scope: &Scope) -> Result<Slot> {
        let root = &path[0];
        let mut current = scope
            .get(root)
            .cloned()
            .ok_or_else(|| EngineError::Resolution(format!("undefined variable '{root}'")))?;

        for segment in &path[1..] {
            current = match current {
                Slot::Entity(shared) => {
                    let guard = shared.read().await;
                    if guard.def().relation(segment).is_some() {
                        match guard.relation(segment).await? {
                            Some(list) => {
                                Slot::List(list.into_iter().map(Slot::Entity).collect())
                            }
                            None => Slot::Null,
                        }
                    } else {
                        match guard.get(segment)? {
                            Some(value) => Slot::Value(value),
                            None => Slot::Null,
                        }
                    }
                }
                Slot::Null => {
                    return Err(EngineError::Resolution(format!(
                        "cannot read '{}' of null (path '{}')",
                        segment,
                        path.join(".")
                    )))
                }
                _ => {
                    return Err(EngineError::Resolution(format!(
                        "cannot read '{}' of a non-entity (path '{}')",
                        segment,
                        path.join(".")
                    )))
                }
            };
        }
        Ok(current)
    }
}

fn operand(slot: Slot, raw: &str) -> Result<Value> {
    match slot {
        Slot::Value(value) => Ok(value),
        Slot::Null => Err(EngineError::Resolution(format!(
            "null operand in expression '{raw}'"
        ))),
        _ => Err(EngineError::Resolution(format!(
            "non-scalar operand in expression '{raw}'"
        ))),
    }
}

fn wrap_argument(param: &Param, raw: &JsonValue) -> Result<Slot> {
    match &param.kind {
        ParamKind::Scalar(kind) => Ok(Slot::Value(kind.wrap_raw(raw)?)),
        ParamKind::List(_) => match raw {
            JsonValue::Array(items) => {
                let slots = items.iter().map(wrap_loose).collect::<Result<Vec<_>>>()?;
                Ok(Slot::List(slots))
            }
            other => Err(EngineError::Resolution(format!(
                "argument '{}' must be a list, got {}",
                param.name, other
            ))),
        },
    }
}

/// List elements carry no declared kind; wrap by their JSON shape.
fn wrap_loose(raw: &JsonValue) -> Result<Slot> {
    match raw {
        JsonValue::Null => Ok(Slot::Null),
        JsonValue::Bool(b) => Ok(Slot::Value(Value::boolean(*b))),
        JsonValue::Number(n) => Ok(Slot::Value(Value::number_from_text(
            &n.to_string(),
            None,
            None,
        )?)),
        JsonValue::String(s) => Ok(Slot::Value(Value::text(s.clone(), None)?)),
        other => Err(EngineError::Resolution(format!(
            "unsupported list element {other}"
        ))),
    }
}

async fn serialize_slot(slot: &Slot) -> JsonValue {
    match slot {
        Slot::Value(value) => value.to_raw(),
        Slot::Entity(shared) => shared_to_tree(shared).await,
        Slot::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(serialize_slot(item)).await);
            }
            JsonValue::Array(out)
        }
        Slot::Null => JsonValue::Null,
    }
}
