//! Expression evaluator
//!
//! Evaluates an AST against a pre-loaded context of entities and
//! relationships. The evaluator never touches storage: the computation
//! service is responsible for batch-loading everything an expression's
//! dependencies can reach before evaluation starts.
//!
//! Null semantics: the absence of a value is `None`; it propagates through
//! arithmetic, comparisons, and unary operators, with the usual three-valued
//! exceptions for `&&` and `||`.

use crate::functions;
use crate::parser::{BinaryOp, Expr, PathSegment, RefBase, Selector, UnaryOp};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;
use trellis_core::{Entity, EntityId, ExpressionError, TenantId, Value, values_equal};

/// Depth bound for nested evaluation.
pub const MAX_EVAL_DEPTH: usize = 50;

// ============================================================================
// CONTEXT
// ============================================================================

/// Everything an evaluation can see.
///
/// `entity_cache` and `relationship_cache` must be pre-populated; a lookup
/// miss resolves to null, never to a database read.
pub struct EvalContext {
    pub tenant_id: TenantId,
    pub current_entity: Entity,
    pub entity_cache: HashMap<EntityId, Entity>,
    pub relationship_cache: HashMap<EntityId, HashMap<String, Vec<EntityId>>>,
    /// `"entity_id.property"` entries for computed properties currently
    /// being evaluated; re-entry is a circular dependency.
    evaluation_stack: HashSet<String>,
    depth: usize,
    pub max_depth: usize,
    accessed: BTreeSet<EntityId>,
}

impl EvalContext {
    pub fn new(tenant_id: TenantId, current_entity: Entity) -> Self {
        Self {
            tenant_id,
            current_entity,
            entity_cache: HashMap::new(),
            relationship_cache: HashMap::new(),
            evaluation_stack: HashSet::new(),
            depth: 0,
            max_depth: MAX_EVAL_DEPTH,
            accessed: BTreeSet::new(),
        }
    }

    pub fn with_caches(
        mut self,
        entity_cache: HashMap<EntityId, Entity>,
        relationship_cache: HashMap<EntityId, HashMap<String, Vec<EntityId>>>,
    ) -> Self {
        self.entity_cache = entity_cache;
        self.relationship_cache = relationship_cache;
        self
    }

    /// Mark a computed property as being evaluated. Fails if it is already
    /// on the stack (a cycle through computed properties).
    pub fn enter_property(
        &mut self,
        entity_id: EntityId,
        property: &str,
    ) -> Result<(), ExpressionError> {
        let key = format!("{}.{}", entity_id, property);
        if !self.evaluation_stack.insert(key.clone()) {
            return Err(ExpressionError::CircularDependency { chain: key });
        }
        Ok(())
    }

    pub fn exit_property(&mut self, entity_id: EntityId, property: &str) {
        self.evaluation_stack.remove(&format!("{}.{}", entity_id, property));
    }

    fn property_value(&mut self, entity_id: EntityId, name: &str) -> Option<Value> {
        self.accessed.insert(entity_id);
        let entity = if self.current_entity.id == entity_id {
            Some(&self.current_entity)
        } else {
            self.entity_cache.get(&entity_id)
        };
        entity
            .and_then(|e| e.property(name))
            .and_then(|p| p.effective_value())
            .cloned()
    }

    fn related_ids(&mut self, entity_id: EntityId, relationship: &str) -> Vec<EntityId> {
        self.accessed.insert(entity_id);
        self.relationship_cache
            .get(&entity_id)
            .and_then(|m| m.get(relationship))
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of one expression evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<ExpressionError>,
    /// Every entity the evaluation touched; the computation service uses
    /// this for cache warming.
    pub accessed_entities: Vec<EntityId>,
    pub duration_ms: f64,
}

/// Evaluate an expression, timing it and collecting the access trace.
pub fn evaluate(expr: &Expr, ctx: &mut EvalContext) -> EvalOutcome {
    let started = Instant::now();
    let result = eval_expr(expr, ctx);
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    let accessed_entities: Vec<EntityId> = ctx.accessed.iter().copied().collect();
    match result {
        Ok(value) => EvalOutcome {
            success: true,
            value,
            error: None,
            accessed_entities,
            duration_ms,
        },
        Err(error) => EvalOutcome {
            success: false,
            value: None,
            error: Some(error),
            accessed_entities,
            duration_ms,
        },
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Evaluate one AST node to an optional value.
pub fn eval_expr(
    expr: &Expr,
    ctx: &mut EvalContext,
) -> Result<Option<Value>, ExpressionError> {
    if ctx.depth >= ctx.max_depth {
        return Err(ExpressionError::MaxDepthExceeded { max: ctx.max_depth });
    }
    ctx.depth += 1;
    let result = eval_inner(expr, ctx);
    ctx.depth -= 1;
    result
}

fn eval_inner(expr: &Expr, ctx: &mut EvalContext) -> Result<Option<Value>, ExpressionError> {
    match expr {
        Expr::Literal { value, .. } => Ok(value.clone()),

        Expr::Identifier { name, .. } => {
            let id = ctx.current_entity.id;
            Ok(ctx.property_value(id, name))
        }

        Expr::PropertyRef { base, segments, .. } => eval_property_ref(base, segments, ctx),

        Expr::Unary { op, operand, .. } => {
            let value = eval_expr(operand, ctx)?;
            eval_unary(*op, value)
        }

        Expr::Binary {
            op, left, right, ..
        } => eval_binary(*op, left, right, ctx),

        Expr::Call { name, args, .. } => {
            let folded = name.to_uppercase();
            if folded == "IF" {
                return eval_if(name, args, ctx);
            }
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval_expr(arg, ctx)?);
            }
            functions::invoke(&folded, &evaluated)
        }
    }
}

/// `IF(cond, then, else)` with a lazy unchosen branch and null-propagating
/// condition.
fn eval_if(
    name: &str,
    args: &[Expr],
    ctx: &mut EvalContext,
) -> Result<Option<Value>, ExpressionError> {
    if args.len() != 3 {
        return Err(ExpressionError::TypeMismatch {
            expected: format!("3 argument(s) to {}", name.to_uppercase()),
            found: format!("{} argument(s)", args.len()),
        });
    }
    match eval_expr(&args[0], ctx)? {
        None => Ok(None),
        Some(Value::Boolean { value: true }) => eval_expr(&args[1], ctx),
        Some(Value::Boolean { value: false }) => eval_expr(&args[2], ctx),
        Some(other) => Err(ExpressionError::TypeMismatch {
            expected: "boolean condition for IF".to_string(),
            found: other.kind().to_string(),
        }),
    }
}

fn eval_unary(op: UnaryOp, value: Option<Value>) -> Result<Option<Value>, ExpressionError> {
    let value = match value {
        None => return Ok(None),
        Some(v) => v,
    };
    match op {
        UnaryOp::Not => match value {
            Value::Boolean { value } => Ok(Some(Value::boolean(!value))),
            other => Err(type_mismatch("boolean", &other)),
        },
        UnaryOp::Neg => match value {
            Value::Number { value } => Ok(Some(Value::number(-value))),
            other => Err(type_mismatch("number", &other)),
        },
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut EvalContext,
) -> Result<Option<Value>, ExpressionError> {
    match op {
        // Short-circuit logic with three-valued null handling: the right
        // operand is only evaluated when the left does not decide the
        // result.
        BinaryOp::And => match eval_expr(left, ctx)? {
            Some(Value::Boolean { value: false }) => Ok(Some(Value::boolean(false))),
            Some(Value::Boolean { value: true }) => match eval_expr(right, ctx)? {
                None => Ok(None),
                Some(Value::Boolean { value }) => Ok(Some(Value::boolean(value))),
                Some(other) => Err(type_mismatch("boolean", &other)),
            },
            None => match eval_expr(right, ctx)? {
                Some(Value::Boolean { value: false }) => Ok(Some(Value::boolean(false))),
                Some(Value::Boolean { value: true }) | None => Ok(None),
                Some(other) => Err(type_mismatch("boolean", &other)),
            },
            Some(other) => Err(type_mismatch("boolean", &other)),
        },
        BinaryOp::Or => match eval_expr(left, ctx)? {
            Some(Value::Boolean { value: true }) => Ok(Some(Value::boolean(true))),
            Some(Value::Boolean { value: false }) => match eval_expr(right, ctx)? {
                None => Ok(None),
                Some(Value::Boolean { value }) => Ok(Some(Value::boolean(value))),
                Some(other) => Err(type_mismatch("boolean", &other)),
            },
            None => match eval_expr(right, ctx)? {
                Some(Value::Boolean { value: true }) => Ok(Some(Value::boolean(true))),
                Some(Value::Boolean { value: false }) | None => Ok(None),
                Some(other) => Err(type_mismatch("boolean", &other)),
            },
            Some(other) => Err(type_mismatch("boolean", &other)),
        },

        BinaryOp::Eq => {
            let l = eval_expr(left, ctx)?;
            let r = eval_expr(right, ctx)?;
            Ok(Some(Value::boolean(values_equal(l.as_ref(), r.as_ref()))))
        }
        BinaryOp::Ne => {
            let l = eval_expr(left, ctx)?;
            let r = eval_expr(right, ctx)?;
            Ok(Some(Value::boolean(!values_equal(l.as_ref(), r.as_ref()))))
        }

        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let (l, r) = match numeric_operands(op, left, right, ctx)? {
                Some(pair) => pair,
                None => return Ok(None),
            };
            let result = match op {
                BinaryOp::Lt => l < r,
                BinaryOp::Gt => l > r,
                BinaryOp::Le => l <= r,
                BinaryOp::Ge => l >= r,
                _ => unreachable!("comparison arm only"),
            };
            Ok(Some(Value::boolean(result)))
        }

        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (l, r) = match numeric_operands(op, left, right, ctx)? {
                Some(pair) => pair,
                None => return Ok(None),
            };
            let result = match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => {
                    if r == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    l / r
                }
                BinaryOp::Mod => {
                    if r == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    l % r
                }
                _ => unreachable!("arithmetic arm only"),
            };
            Ok(Some(Value::number(result)))
        }
    }
}

/// Evaluate both operands of a numeric operator. `Ok(None)` means a null
/// operand (the operation propagates null); non-numbers are type errors.
fn numeric_operands(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut EvalContext,
) -> Result<Option<(f64, f64)>, ExpressionError> {
    let l = eval_expr(left, ctx)?;
    let r = eval_expr(right, ctx)?;
    let (l, r) = match (l, r) {
        (Some(l), Some(r)) => (l, r),
        _ => return Ok(None),
    };
    let l = l.as_number().ok_or_else(|| ExpressionError::TypeMismatch {
        expected: format!("number operands for '{}'", op.symbol()),
        found: l.kind().to_string(),
    })?;
    let r = r.as_number().ok_or_else(|| ExpressionError::TypeMismatch {
        expected: format!("number operands for '{}'", op.symbol()),
        found: r.kind().to_string(),
    })?;
    Ok(Some((l, r)))
}

fn type_mismatch(expected: &str, found: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch {
        expected: expected.to_string(),
        found: found.kind().to_string(),
    }
}

// ============================================================================
// PATH TRAVERSAL
// ============================================================================

fn eval_property_ref(
    base: &RefBase,
    segments: &[PathSegment],
    ctx: &mut EvalContext,
) -> Result<Option<Value>, ExpressionError> {
    let mut working: Vec<EntityId> = match base {
        RefBase::Current => vec![ctx.current_entity.id],
        RefBase::Entity(id) => {
            ctx.accessed.insert(*id);
            vec![*id]
        }
    };
    let mut collection = false;

    let (last, intermediate) = match segments.split_last() {
        Some(split) => split,
        None => return Ok(None),
    };

    for segment in intermediate {
        let mut next = Vec::new();
        for id in &working {
            let related = ctx.related_ids(*id, &segment.name);
            match segment.selector {
                // A plain intermediate segment is a to-one hop: take the
                // first related entity.
                Selector::One => next.extend(related.into_iter().take(1)),
                Selector::All => {
                    collection = true;
                    next.extend(related);
                }
                Selector::Index(n) => next.extend(related.into_iter().nth(n)),
            }
        }
        working = next;
        if working.is_empty() {
            break;
        }
    }

    match last.selector {
        Selector::One => {
            if collection {
                let mut items = Vec::new();
                for id in &working {
                    if let Some(value) = ctx.property_value(*id, &last.name) {
                        items.push(value);
                    }
                }
                Ok(Some(Value::list(items)))
            } else {
                match working.first() {
                    Some(id) => Ok(ctx.property_value(*id, &last.name)),
                    None => Ok(None),
                }
            }
        }
        // A trailing `[*]` expands the final segment as a relationship and
        // yields the related entities as references.
        Selector::All => {
            let mut items = Vec::new();
            for id in &working {
                for target in ctx.related_ids(*id, &last.name) {
                    ctx.accessed.insert(target);
                    items.push(Value::reference(target));
                }
            }
            Ok(Some(Value::list(items)))
        }
        Selector::Index(n) => match working.first() {
            Some(id) => {
                let related = ctx.related_ids(*id, &last.name);
                Ok(related.get(n).map(|target| {
                    ctx.accessed.insert(*target);
                    Value::reference(*target)
                }))
            }
            None => Ok(None),
        },
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use trellis_core::{ActorId, Property, RecordIdType, TypePath};

    fn make_entity(tenant: TenantId, props: &[(&str, Value)]) -> Entity {
        let mut properties = BTreeMap::new();
        for (name, value) in props {
            properties.insert(name.to_string(), Property::literal(value.clone()));
        }
        Entity {
            id: EntityId::now_v7(),
            tenant_id: tenant,
            entity_type: TypePath::new_unchecked("part"),
            properties,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: ActorId::now_v7(),
            deleted_at: None,
        }
    }

    fn eval_on(entity: Entity, source: &str) -> Result<Option<Value>, ExpressionError> {
        let mut ctx = EvalContext::new(entity.tenant_id, entity);
        eval_expr(&parse(source).expect("parse"), &mut ctx)
    }

    fn eval_simple(source: &str) -> Result<Option<Value>, ExpressionError> {
        let tenant = TenantId::now_v7();
        eval_on(make_entity(tenant, &[]), source)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_simple("1 + 2 * 3"), Ok(Some(Value::number(7.0))));
        assert_eq!(eval_simple("(1 + 2) * 3"), Ok(Some(Value::number(9.0))));
        assert_eq!(eval_simple("10 % 3"), Ok(Some(Value::number(1.0))));
        assert_eq!(eval_simple("-2 * 3"), Ok(Some(Value::number(-6.0))));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval_simple("1 / 0"), Err(ExpressionError::DivisionByZero));
        assert_eq!(eval_simple("1 % 0"), Err(ExpressionError::DivisionByZero));
    }

    #[test]
    fn test_null_propagation_arithmetic() {
        assert_eq!(eval_simple("null + 1"), Ok(None));
        assert_eq!(eval_simple("1 - null"), Ok(None));
        assert_eq!(eval_simple("-null"), Ok(None));
        assert_eq!(eval_simple("!null"), Ok(None));
        assert_eq!(eval_simple("null < 1"), Ok(None));
    }

    #[test]
    fn test_null_equality() {
        assert_eq!(eval_simple("null == null"), Ok(Some(Value::boolean(true))));
        assert_eq!(eval_simple("null == 1"), Ok(Some(Value::boolean(false))));
        assert_eq!(eval_simple("null != 1"), Ok(Some(Value::boolean(true))));
        assert_eq!(eval_simple("'a' == 'a'"), Ok(Some(Value::boolean(true))));
    }

    #[test]
    fn test_logic_short_circuit() {
        assert_eq!(
            eval_simple("false && (1 / 0 == 0)"),
            Ok(Some(Value::boolean(false)))
        );
        assert_eq!(
            eval_simple("true || (1 / 0 == 0)"),
            Ok(Some(Value::boolean(true)))
        );
    }

    #[test]
    fn test_logic_null_handling() {
        assert_eq!(eval_simple("null && true"), Ok(None));
        assert_eq!(eval_simple("null && false"), Ok(Some(Value::boolean(false))));
        assert_eq!(eval_simple("null || true"), Ok(Some(Value::boolean(true))));
        assert_eq!(eval_simple("null || false"), Ok(None));
        assert_eq!(eval_simple("true && null"), Ok(None));
    }

    #[test]
    fn test_type_mismatches() {
        for source in ["'a' + 1", "'a' < 'b'", "1 && true", "!1", "-'a'"] {
            assert!(
                matches!(
                    eval_simple(source),
                    Err(ExpressionError::TypeMismatch { .. })
                ),
                "{} should be a type mismatch",
                source
            );
        }
    }

    #[test]
    fn test_if_laziness_and_null() {
        assert_eq!(
            eval_simple("IF(true, 1, 1 / 0)"),
            Ok(Some(Value::number(1.0)))
        );
        assert_eq!(
            eval_simple("IF(false, 1 / 0, 2)"),
            Ok(Some(Value::number(2.0)))
        );
        assert_eq!(eval_simple("IF(null, 1, 2)"), Ok(None));
    }

    #[test]
    fn test_function_names_case_insensitive() {
        assert_eq!(
            eval_simple("coalesce(null, 5)"),
            Ok(Some(Value::number(5.0)))
        );
        assert_eq!(
            eval_simple("Upper('abc')"),
            Ok(Some(Value::text("ABC")))
        );
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            eval_simple("NO_SUCH_FN(1)"),
            Err(ExpressionError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_property_shorthand_resolution() {
        let tenant = TenantId::now_v7();
        let entity = make_entity(
            tenant,
            &[("unit_cost", Value::number(5.0)), ("quantity", Value::number(4.0))],
        );
        assert_eq!(
            eval_on(entity, "#unit_cost * #quantity"),
            Ok(Some(Value::number(20.0)))
        );
    }

    #[test]
    fn test_missing_property_is_null() {
        let tenant = TenantId::now_v7();
        let entity = make_entity(tenant, &[]);
        assert_eq!(eval_on(entity, "#missing"), Ok(None));
        let tenant = TenantId::now_v7();
        let entity = make_entity(tenant, &[]);
        assert_eq!(
            eval_on(entity, "#missing == null"),
            Ok(Some(Value::boolean(true)))
        );
    }

    #[test]
    fn test_collection_traversal_sum() {
        let tenant = TenantId::now_v7();
        let root = make_entity(tenant, &[]);
        let a = make_entity(tenant, &[("price", Value::number(10.0))]);
        let b = make_entity(tenant, &[("price", Value::number(20.0))]);

        let mut entity_cache = HashMap::new();
        entity_cache.insert(a.id, a.clone());
        entity_cache.insert(b.id, b.clone());
        let mut relationship_cache = HashMap::new();
        relationship_cache.insert(
            root.id,
            HashMap::from([("items".to_string(), vec![a.id, b.id])]),
        );

        let mut ctx = EvalContext::new(tenant, root).with_caches(entity_cache, relationship_cache);
        let expr = parse("SUM(@self.items[*].price)").expect("parse");
        assert_eq!(eval_expr(&expr, &mut ctx), Ok(Some(Value::number(30.0))));
    }

    #[test]
    fn test_to_one_chain_traversal() {
        let tenant = TenantId::now_v7();
        let root = make_entity(tenant, &[]);
        let parent = make_entity(tenant, &[]);
        let category = make_entity(tenant, &[("markup", Value::number(1.5))]);

        let mut entity_cache = HashMap::new();
        entity_cache.insert(parent.id, parent.clone());
        entity_cache.insert(category.id, category.clone());
        let mut relationship_cache = HashMap::new();
        relationship_cache.insert(
            root.id,
            HashMap::from([("parent".to_string(), vec![parent.id])]),
        );
        relationship_cache.insert(
            parent.id,
            HashMap::from([("category".to_string(), vec![category.id])]),
        );

        let mut ctx =
            EvalContext::new(tenant, root).with_caches(entity_cache, relationship_cache);
        let expr = parse("@self.parent.category.markup").expect("parse");
        assert_eq!(eval_expr(&expr, &mut ctx), Ok(Some(Value::number(1.5))));
    }

    #[test]
    fn test_index_selector_traversal() {
        let tenant = TenantId::now_v7();
        let root = make_entity(tenant, &[]);
        let a = make_entity(tenant, &[("price", Value::number(10.0))]);
        let b = make_entity(tenant, &[("price", Value::number(20.0))]);

        let mut entity_cache = HashMap::new();
        entity_cache.insert(a.id, a.clone());
        entity_cache.insert(b.id, b.clone());
        let mut relationship_cache = HashMap::new();
        relationship_cache.insert(
            root.id,
            HashMap::from([("items".to_string(), vec![a.id, b.id])]),
        );

        let mut ctx =
            EvalContext::new(tenant, root).with_caches(entity_cache, relationship_cache);
        let expr = parse("@self.items[1].price").expect("parse");
        assert_eq!(eval_expr(&expr, &mut ctx), Ok(Some(Value::number(20.0))));
    }

    #[test]
    fn test_explicit_entity_reference() {
        let tenant = TenantId::now_v7();
        let current = make_entity(tenant, &[]);
        let other = make_entity(tenant, &[("name", Value::text("Widget"))]);

        let mut entity_cache = HashMap::new();
        entity_cache.insert(other.id, other.clone());

        let mut ctx = EvalContext::new(tenant, current).with_caches(entity_cache, HashMap::new());
        let expr = parse(&format!("@{{{}}}.name", other.id)).expect("parse");
        assert_eq!(eval_expr(&expr, &mut ctx), Ok(Some(Value::text("Widget"))));
    }

    #[test]
    fn test_accessed_entities_recorded() {
        let tenant = TenantId::now_v7();
        let root = make_entity(tenant, &[]);
        let a = make_entity(tenant, &[("price", Value::number(10.0))]);
        let root_id = root.id;
        let a_id = a.id;

        let mut entity_cache = HashMap::new();
        entity_cache.insert(a.id, a.clone());
        let mut relationship_cache = HashMap::new();
        relationship_cache.insert(
            root.id,
            HashMap::from([("items".to_string(), vec![a.id])]),
        );

        let mut ctx =
            EvalContext::new(tenant, root).with_caches(entity_cache, relationship_cache);
        let expr = parse("SUM(@self.items[*].price)").expect("parse");
        let outcome = evaluate(&expr, &mut ctx);
        assert!(outcome.success);
        assert!(outcome.accessed_entities.contains(&root_id));
        assert!(outcome.accessed_entities.contains(&a_id));
    }

    #[test]
    fn test_circular_dependency_guard() {
        let tenant = TenantId::now_v7();
        let entity = make_entity(tenant, &[]);
        let id = entity.id;
        let mut ctx = EvalContext::new(tenant, entity);
        ctx.enter_property(id, "a").expect("first entry");
        assert!(matches!(
            ctx.enter_property(id, "a"),
            Err(ExpressionError::CircularDependency { .. })
        ));
        ctx.exit_property(id, "a");
        ctx.enter_property(id, "a").expect("re-entry after exit");
    }

    #[test]
    fn test_depth_limit() {
        // Deeply nested parenthesized expression
        let mut source = String::new();
        for _ in 0..60 {
            source.push_str("(1 + ");
        }
        source.push('1');
        for _ in 0..60 {
            source.push(')');
        }
        let tenant = TenantId::now_v7();
        let entity = make_entity(tenant, &[]);
        assert!(matches!(
            eval_on(entity, &source),
            Err(ExpressionError::MaxDepthExceeded { .. })
        ));
    }

    #[test]
    fn test_stale_computed_value_used_best_effort() {
        let tenant = TenantId::now_v7();
        let mut entity = make_entity(tenant, &[]);
        entity.properties.insert(
            "derived".to_string(),
            Property::Computed {
                expression: "#x".to_string(),
                dependencies: vec![],
                cached_value: Some(Value::number(42.0)),
                status: trellis_core::PropertyStatus::Stale,
                last_error: None,
            },
        );
        assert_eq!(eval_on(entity, "#derived"), Ok(Some(Value::number(42.0))));
    }
}
