//! Dependency extraction
//!
//! A single traversal over an AST collecting the deduplicated set of
//! property dependencies. This runs when a computed property is created or
//! its expression changes; the result is persisted on the property and
//! feeds the dependent index that drives staleness propagation.

use crate::parser::{Expr, RefBase, Selector};
use std::collections::BTreeSet;
use trellis_core::{DependencyPath, DependencyRef};

/// Collect the deduplicated dependencies of an expression.
///
/// `#x` and `@self.x` yield the same dependency. Output order is stable
/// (sorted), which keeps persisted dependency lists diff-friendly.
pub fn extract_dependencies(expr: &Expr) -> Vec<DependencyPath> {
    let mut out = BTreeSet::new();
    walk(expr, &mut out);
    out.into_iter().collect()
}

fn walk(expr: &Expr, out: &mut BTreeSet<DependencyPath>) {
    match expr {
        Expr::Literal { .. } => {}
        Expr::Identifier { name, .. } => {
            out.insert(DependencyPath::own(name.clone()));
        }
        Expr::PropertyRef { base, segments, .. } => {
            let entity_ref = match base {
                RefBase::Current => DependencyRef::Current,
                RefBase::Entity(id) => DependencyRef::Entity(*id),
            };
            let (last, relationships) = match segments.split_last() {
                Some(split) => split,
                None => return,
            };
            let is_collection = segments
                .iter()
                .any(|s| matches!(s.selector, Selector::All));
            let relationships: Vec<String> =
                relationships.iter().map(|s| s.name.clone()).collect();
            out.insert(DependencyPath::new(
                entity_ref,
                relationships,
                last.name.clone(),
                is_collection,
            ));
        }
        Expr::Unary { operand, .. } => walk(operand, out),
        Expr::Binary { left, right, .. } => {
            walk(left, out);
            walk(right, out);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                walk(arg, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn deps(source: &str) -> Vec<DependencyPath> {
        extract_dependencies(&parse(source).expect("parse"))
    }

    #[test]
    fn test_repeated_reference_deduplicates() {
        let d = deps("#x + #x + #x");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].property, "x");
        assert_eq!(d[0].entity_ref, DependencyRef::Current);
        assert!(!d[0].is_collection);
    }

    #[test]
    fn test_shorthand_and_long_form_collapse() {
        let d = deps("#x + @self.x");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "self.x");
    }

    #[test]
    fn test_relationship_chain() {
        let d = deps("@self.parent.category.markup");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].relationships, vec!["parent", "category"]);
        assert_eq!(d[0].property, "markup");
        assert!(!d[0].is_collection);
    }

    #[test]
    fn test_collection_traversal() {
        let d = deps("SUM(@self.items[*].price)");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].relationships, vec!["items"]);
        assert_eq!(d[0].property, "price");
        assert!(d[0].is_collection);
        assert_eq!(d[0].path, "self.items[*].price");
    }

    #[test]
    fn test_explicit_entity_reference() {
        let d = deps("@{550e8400-e29b-41d4-a716-446655440000}.name");
        assert_eq!(d.len(), 1);
        match d[0].entity_ref {
            DependencyRef::Entity(id) => {
                assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000")
            }
            DependencyRef::Current => panic!("expected an explicit entity ref"),
        }
    }

    #[test]
    fn test_multiple_distinct_dependencies() {
        let d = deps("IF(#flag, #a * #b, @self.parent.a)");
        let paths: Vec<&str> = d.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["self.a", "self.b", "self.flag", "self.parent.a"]);
    }

    #[test]
    fn test_literals_have_no_dependencies() {
        assert!(deps("1 + 2 * 3").is_empty());
        assert!(deps("CONCAT('a', 'b')").is_empty());
    }
}
