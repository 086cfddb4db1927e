//! Property-based tests for the expression pipeline

use proptest::prelude::*;
use trellis_core::{
    ActorId, Entity, EntityId, Property, RecordIdType, TenantId, TypePath, Value,
};
use trellis_expr::{evaluate, extract_dependencies, parse, EvalContext};

fn entity_with(props: &[(&str, f64)]) -> Entity {
    let mut properties = std::collections::BTreeMap::new();
    for (name, n) in props {
        properties.insert(name.to_string(), Property::literal(Value::number(*n)));
    }
    Entity {
        id: EntityId::now_v7(),
        tenant_id: TenantId::now_v7(),
        entity_type: TypePath::new_unchecked("part"),
        properties,
        version: 1,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        created_by: ActorId::now_v7(),
        deleted_at: None,
    }
}

fn eval_source(source: &str, entity: Entity) -> Option<Value> {
    let mut ctx = EvalContext::new(entity.tenant_id, entity);
    let expr = parse(source).expect("parse");
    let outcome = evaluate(&expr, &mut ctx);
    assert!(
        outcome.success,
        "evaluation of {:?} failed: {:?}",
        source, outcome.error
    );
    outcome.value
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Integer literals round-trip through the lexer and evaluator.
    #[test]
    fn prop_integer_literals_round_trip(n in -1_000_000i64..1_000_000) {
        let source = if n < 0 {
            format!("0 - {}", -n)
        } else {
            format!("{}", n)
        };
        let value = eval_source(&source, entity_with(&[]));
        prop_assert_eq!(value, Some(Value::number(n as f64)));
    }

    /// Multiplication binds tighter than addition for arbitrary operands.
    #[test]
    fn prop_precedence_mul_over_add(a in 0i32..1000, b in 0i32..1000, c in 0i32..1000) {
        let source = format!("{} + {} * {}", a, b, c);
        let value = eval_source(&source, entity_with(&[]));
        let expected = a as f64 + (b as f64 * c as f64);
        prop_assert_eq!(value, Some(Value::number(expected)));
    }

    /// String literals survive lexing regardless of inner whitespace and
    /// escaped characters.
    #[test]
    fn prop_string_literals_round_trip(s in "[a-zA-Z0-9 _.,;:!?-]{0,40}") {
        let source = format!("\"{}\"", s);
        let value = eval_source(&source, entity_with(&[]));
        prop_assert_eq!(value, Some(Value::text(s)));
    }

    /// Dependency extraction never yields duplicates, however many times a
    /// property is referenced.
    #[test]
    fn prop_dependency_extraction_deduplicates(reps in 1usize..8) {
        let source = (0..reps).map(|_| "#x").collect::<Vec<_>>().join(" + ");
        let expr = parse(&source).expect("parse");
        let deps = extract_dependencies(&expr);
        prop_assert_eq!(deps.len(), 1);
    }

    /// Property resolution matches direct arithmetic on the property values.
    #[test]
    fn prop_property_arithmetic(a in -1000.0f64..1000.0, b in -1000.0f64..1000.0) {
        let entity = entity_with(&[("a", a), ("b", b)]);
        let value = eval_source("#a + #b", entity);
        prop_assert_eq!(value, Some(Value::number(a + b)));
    }

    /// Equality is reflexive for any number.
    #[test]
    fn prop_equality_reflexive(a in -1e9f64..1e9) {
        let entity = entity_with(&[("a", a)]);
        let value = eval_source("#a == #a", entity);
        prop_assert_eq!(value, Some(Value::boolean(true)));
    }

    /// COALESCE returns its first non-null argument.
    #[test]
    fn prop_coalesce_first_non_null(n in -1000.0f64..1000.0) {
        let entity = entity_with(&[("present", n)]);
        let value = eval_source("COALESCE(#absent, #present, 0)", entity);
        prop_assert_eq!(value, Some(Value::number(n)));
    }

    /// Parsing is deterministic: the same source yields the same AST.
    #[test]
    fn prop_parse_deterministic(a in 0i32..100, b in 0i32..100) {
        let source = format!("#x * {} + MIN(@self.items[*].n) - {}", a, b);
        let first = parse(&source).expect("parse");
        let second = parse(&source).expect("parse");
        prop_assert_eq!(first, second);
    }
}
