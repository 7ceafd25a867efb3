//! Parse/unparse round-trip properties, proptest-driven: generated trees
//! survive printing and re-parsing structurally intact, with numbers equal
//! to the last ULP and canonical (sorted) output stable.

use std::sync::Arc;

use proptest::prelude::*;

use sylva::node_manager::NodeManager;
use sylva::{parser, tree};

/// Generate a random expression in the native text format.
fn expression() -> impl Strategy<Value = String> {
    let number = prop_oneof![
        (-1.0e9..1.0e9f64).prop_map(|v| parser::format_number(v)),
        (-1000i64..1000).prop_map(|v| v.to_string()),
        Just(".infinity".to_string()),
        Just("-.infinity".to_string()),
    ];
    let string = "[a-z0-9 ]{0,12}".prop_map(|s| format!("{:?}", s));
    let leaf = prop_oneof![
        number,
        string,
        Just("(true)".to_string()),
        Just("(false)".to_string()),
        Just("(null)".to_string()),
    ];

    leaf.prop_recursive(4, 48, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4)
                .prop_map(|items| format!("(list {})", items.join(" "))),
            prop::collection::vec(("[a-z]{1,6}", inner.clone()), 0..4).prop_map(|pairs| {
                let body: Vec<String> = pairs
                    .into_iter()
                    .map(|(k, v)| format!("{} {}", k, v))
                    .collect();
                format!("(assoc {})", body.join(" "))
            }),
            prop::collection::vec(inner, 1..4)
                .prop_map(|items| format!("(+ {})", items.join(" "))),
        ]
    })
}

proptest! {
    /// parse(unparse(n)) is structurally equal to n.
    #[test]
    fn unparse_then_parse_is_identity(source in expression()) {
        let manager = Arc::new(NodeManager::new());
        let original = parser::parse(&source, &manager, "gen", false).unwrap();

        for pretty in [false, true] {
            let printed = parser::unparse(&manager, original, pretty, true, false);
            let reparsed = parser::parse(&printed, &manager, "roundtrip", false).unwrap();
            prop_assert!(
                tree::deep_equal(&manager, original, &manager, reparsed),
                "roundtrip changed structure:\n{}\n-> {}",
                source,
                printed
            );
        }
    }

    /// Canonical (sorted) output is a fixed point: printing the reparse of
    /// sorted output reproduces it byte for byte.
    #[test]
    fn sorted_unparse_is_stable(source in expression()) {
        let manager = Arc::new(NodeManager::new());
        let original = parser::parse(&source, &manager, "gen", false).unwrap();
        let first = parser::unparse(&manager, original, false, true, true);
        let reparsed = parser::parse(&first, &manager, "roundtrip", false).unwrap();
        let second = parser::unparse(&manager, reparsed, false, true, true);
        prop_assert_eq!(first, second);
    }

    /// Numbers survive to the last ULP.
    #[test]
    fn numbers_roundtrip_exactly(value in prop::num::f64::NORMAL | prop::num::f64::ZERO) {
        let manager = Arc::new(NodeManager::new());
        let text = parser::format_number(value);
        let node = parser::parse(&text, &manager, "num", false).unwrap();
        prop_assert_eq!(manager.number_of(node).to_bits(), value.to_bits());
    }

    /// Labels survive round-trips.
    #[test]
    fn labels_roundtrip(label in "[a-z][a-z0-9_]{0,10}") {
        let manager = Arc::new(NodeManager::new());
        let source = format!("(list #{} 1)", label);
        let original = parser::parse(&source, &manager, "gen", false).unwrap();
        let printed = parser::unparse(&manager, original, false, true, false);
        let reparsed = parser::parse(&printed, &manager, "roundtrip", false).unwrap();

        let child = manager.child(reparsed, 0).unwrap();
        let labels = manager.labels_of(child);
        prop_assert_eq!(labels.len(), 1);
        prop_assert_eq!(sylva::intern::text(labels[0]), label);
    }

    /// Comments survive round-trips when emitted.
    #[test]
    fn comments_roundtrip(comment in "[a-z0-9]([a-z0-9 ]{0,20}[a-z0-9])?") {
        let manager = Arc::new(NodeManager::new());
        let source = format!("; {}\n(list 1)", comment);
        let original = parser::parse(&source, &manager, "gen", false).unwrap();
        let printed = parser::unparse(&manager, original, false, true, false);
        let reparsed = parser::parse(&printed, &manager, "roundtrip", false).unwrap();
        prop_assert_eq!(sylva::intern::text(manager.comment_of(reparsed)), comment);
    }
}
