//! Opcode-level parallelism: serial and parallel evaluation of
//! side-effect-free programs must agree, and the batch handshake must fall
//! back to serial evaluation gracefully.

use sylva::entity::Entity;
use sylva::interpreter::Interpreter;
use sylva::value::Immediate;
use sylva::{parser, NodeKind};

fn eval_list(source: &str, request_concurrency: bool) -> Vec<f64> {
    let entity = Entity::with_seed("conc", "conc-seed");
    let manager = entity.manager().clone();
    let program = parser::parse(source, &manager, "test", false).unwrap();
    if request_concurrency {
        manager.set_concurrency_requested(program, true);
    }
    entity.set_root(Some(program));

    let mut interpreter = Interpreter::new(&entity);
    let result = interpreter.execute(program, false);
    let id = result.node_id().expect("expected a list result");
    assert_eq!(manager.kind_of(id), NodeKind::List);
    manager
        .children_of(id)
        .into_iter()
        .map(|c| manager.number_of(c))
        .collect()
}

#[test]
fn concurrent_map_doubles_elements() {
    // The canonical parallel map: one worker per element.
    let values = eval_list("(map (lambda (* (current_value) 2)) (list 1 2 3))", true);
    assert_eq!(values, vec![2.0, 4.0, 6.0]);
}

#[test]
fn serial_and_parallel_map_agree() {
    let source = "(map (lambda (* (current_value) (current_value))) (list 1 2 3 4))";
    assert_eq!(eval_list(source, false), eval_list(source, true));
}

#[test]
fn concurrent_list_construction_preserves_order() {
    let values = eval_list("(list (+ 1 0) (+ 1 1) (+ 1 2) (+ 1 3))", true);
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn oversized_fanout_falls_back_to_serial() {
    // More children than any machine's permit pool: the batch handshake
    // must decline and the opcode must still produce the right answer.
    let elements: Vec<String> = (0..512).map(|i| i.to_string()).collect();
    let source = format!(
        "(map (lambda (+ (current_value) 1)) (list {}))",
        elements.join(" ")
    );
    let values = eval_list(&source, true);
    assert_eq!(values.len(), 512);
    assert_eq!(values[0], 1.0);
    assert_eq!(values[511], 512.0);
}

#[test]
fn parallel_opcode_returns_null() {
    let entity = Entity::with_seed("conc", "seed");
    let manager = entity.manager().clone();
    let program = parser::parse("(parallel (+ 1 1) (+ 2 2))", &manager, "test", false).unwrap();
    manager.set_concurrency_requested(program, true);
    entity.set_root(Some(program));

    let mut interpreter = Interpreter::new(&entity);
    let result = interpreter.execute(program, false);
    assert!(matches!(result.value, Immediate::Null));
}

#[test]
fn workers_read_shared_frames() {
    // The lexical chain below the fan-out point is shared with workers.
    let entity = Entity::with_seed("conc", "seed");
    let manager = entity.manager().clone();
    let source =
        r#"(let (assoc "base" 10) (map (lambda (+ (retrieve "base") (current_value))) (list 1 2 3)))"#;
    let program = parser::parse(source, &manager, "test", false).unwrap();
    entity.set_root(Some(program));

    // Request concurrency on the inner map node.
    let let_children = manager.children_of(program);
    let map_node = let_children[1];
    assert_eq!(manager.kind_of(map_node), NodeKind::Map);
    manager.set_concurrency_requested(map_node, true);

    let mut interpreter = Interpreter::new(&entity);
    let result = interpreter.execute(program, false);
    let id = result.node_id().expect("expected a list result");
    let values: Vec<f64> = manager
        .children_of(id)
        .into_iter()
        .map(|c| manager.number_of(c))
        .collect();
    assert_eq!(values, vec![11.0, 12.0, 13.0]);
}
