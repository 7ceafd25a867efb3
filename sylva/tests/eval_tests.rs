//! End-to-end evaluation tests: the core opcode table driven through the
//! parser, plus resource budgeting behavior.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sylva::entity::Entity;
use sylva::interpreter::{Interpreter, PerformanceConstraints};
use sylva::value::Immediate;
use sylva::{intern, parser, NodeKind};

fn eval(source: &str) -> (Arc<Entity>, sylva::EvalResult) {
    let entity = Entity::with_seed("test", "test-seed");
    let program = parser::parse(source, entity.manager(), "test", false).unwrap();
    entity.set_root(Some(program));
    let mut interpreter = Interpreter::new(&entity);
    let result = interpreter.execute(program, true);
    (entity, result)
}

fn eval_number(source: &str) -> f64 {
    let (entity, result) = eval(source);
    match result.value {
        Immediate::Number(v) => v,
        Immediate::Node(id) if entity.manager().kind_of(id) == NodeKind::Number => {
            entity.manager().number_of(id)
        }
        other => panic!("expected a number from {:?}, got {:?}", source, other),
    }
}

fn eval_string(source: &str) -> String {
    let (entity, result) = eval(source);
    match result.value {
        Immediate::Str(sid) => intern::text(sid),
        Immediate::Node(id) if entity.manager().kind_of(id) == NodeKind::String => {
            intern::text(entity.manager().symbol_of(id))
        }
        other => panic!("expected a string from {:?}, got {:?}", source, other),
    }
}

fn eval_numbers(source: &str) -> Vec<f64> {
    let (entity, result) = eval(source);
    let manager = entity.manager();
    let id = result.node_id().expect("expected a list result");
    assert_eq!(manager.kind_of(id), NodeKind::List);
    manager
        .children_of(id)
        .into_iter()
        .map(|c| manager.number_of(c))
        .collect()
}

fn eval_bool(source: &str) -> bool {
    eval_number(source) != 0.0
}

// ---------------------------------------------------------------------------
// Arithmetic and math
// ---------------------------------------------------------------------------

#[test]
fn addition_folds_operands() {
    assert_eq!(eval_number("(+ 1 2 3)"), 6.0);
}

#[test]
fn arithmetic_conventions() {
    assert_eq!(eval_number("(- 10 1 2)"), 7.0);
    assert_eq!(eval_number("(- 5)"), -5.0);
    assert_eq!(eval_number("(* 2 3 4)"), 24.0);
    assert_eq!(eval_number("(/ 12 4)"), 3.0);
    assert_eq!(eval_number("(/ 4)"), 0.25);
    assert_eq!(eval_number("(mod 10 3)"), 1.0);
    assert!(eval_number("(+ 1 (null))").is_nan());
}

#[test]
fn rounding_family() {
    assert_eq!(eval_number("(floor 2.7)"), 2.0);
    assert_eq!(eval_number("(ceil 2.1)"), 3.0);
    assert_eq!(eval_number("(round 2.5)"), 3.0);
    assert_eq!(eval_number("(round 2.347 2)"), 2.35);
}

#[test]
fn extended_math() {
    assert!((eval_number("(sqrt 16)") - 4.0).abs() < 1e-12);
    assert!((eval_number("(pow 2 10)") - 1024.0).abs() < 1e-12);
    assert!((eval_number("(log (exp 1))") - 1.0).abs() < 1e-12);
    assert!((eval_number("(log 8 2)") - 3.0).abs() < 1e-12);
    assert!((eval_number("(sin 0)")).abs() < 1e-12);
    assert_eq!(eval_number("(abs -3.5)"), 3.5);
    assert_eq!(eval_number("(max 1 7 3)"), 7.0);
    assert_eq!(eval_number("(min 1 7 3 .nan)"), 1.0);
}

#[test]
fn dot_product_and_entropy() {
    assert_eq!(eval_number("(dot_product (list 1 2 3) (list 4 5 6))"), 32.0);
    let h = eval_number("(entropy (list 0.5 0.5))");
    assert!((h - std::f64::consts::LN_2).abs() < 1e-12);
}

#[test]
fn digits_roundtrip() {
    assert_eq!(eval_numbers("(get_digits 123)"), vec![1.0, 2.0, 3.0]);
    assert_eq!(eval_number("(set_digits 0 10 (list 4 0 4))"), 404.0);
}

// ---------------------------------------------------------------------------
// Control flow, scopes, and bindings
// ---------------------------------------------------------------------------

#[test]
fn if_picks_first_true_branch() {
    assert_eq!(eval_number("(if (false) 1 (true) 2 3)"), 2.0);
    assert_eq!(eval_number("(if (false) 1 3)"), 3.0);
    let (_, result) = eval("(if (false) 1)");
    assert!(result.is_null());
}

#[test]
fn seq_returns_last() {
    assert_eq!(eval_number("(seq 1 2 3)"), 3.0);
}

#[test]
fn conclude_stops_a_sequence() {
    assert_eq!(eval_number("(seq 1 (conclude 42) 3)"), 42.0);
}

#[test]
fn let_binds_and_scopes() {
    assert_eq!(eval_number(r#"(let (assoc "x" 4) (+ (retrieve "x") 1))"#), 5.0);
    // Inner scopes shadow without clobbering.
    assert_eq!(
        eval_number(
            r#"(let (assoc "x" 1)
                 (+ (let (assoc "x" 10) (retrieve "x")) (retrieve "x")))"#
        ),
        11.0
    );
}

#[test]
fn declare_defaults_without_overwriting() {
    assert_eq!(
        eval_number(r#"(let (assoc "x" 1) (declare (assoc "x" 9 "y" 2) (+ (retrieve "x") (retrieve "y"))))"#),
        3.0
    );
}

#[test]
fn assign_rebinds_in_defining_frame() {
    assert_eq!(
        eval_number(
            r#"(let (assoc "n" 5)
                 (seq (assign "n" (- (retrieve "n") 1)) (retrieve "n")))"#
        ),
        4.0
    );
}

#[test]
fn accum_type_table() {
    assert_eq!(
        eval_number(r#"(let (assoc "n" 1) (seq (accum "n" 2) (retrieve "n")))"#),
        3.0
    );
    assert_eq!(
        eval_string(r#"(let (assoc "s" "ab") (seq (accum "s" "cd") (retrieve "s")))"#),
        "abcd"
    );
    assert_eq!(
        eval_numbers(r#"(let (assoc "l" (list 1)) (seq (accum "l" (list 2 3)) (retrieve "l")))"#),
        vec![1.0, 2.0, 3.0]
    );
}

#[test]
fn while_counts_down() {
    // Five observable iterations counting down to zero.
    assert_eq!(
        eval_number(
            r#"(let (assoc "n" 5)
                 (while (> (retrieve "n") 0)
                   (assign "n" (- (retrieve "n") 1))
                   (retrieve "n")))"#
        ),
        0.0
    );
}

#[test]
fn lambda_and_call() {
    assert_eq!(
        eval_number(r#"(call (lambda (+ (retrieve "a") (retrieve "b"))) (assoc "a" 2 "b" 3))"#),
        5.0
    );
}

#[test]
fn call_unwinds_return() {
    assert_eq!(
        eval_number(r#"(call (lambda (seq (return 7) 9)) (assoc))"#),
        7.0
    );
}

#[test]
fn entity_root_assoc_resolves_symbols() {
    // Symbols with no stack binding resolve against the entity root.
    let entity = Entity::with_seed("E", "seed");
    let root = parser::parse(r#"(associate "x" 10 "y" 20)"#, entity.manager(), "root", false)
        .unwrap();
    entity.set_root(Some(root));

    let program = parser::parse(r#"(retrieve "x")"#, entity.manager(), "q", false).unwrap();
    entity.manager().keep_node_reference(program);
    let mut interpreter = Interpreter::new(&entity);
    let result = interpreter.execute(program, true);
    let value = match result.value {
        Immediate::Number(v) => v,
        Immediate::Node(id) => entity.manager().number_of(id),
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(value, 10.0);
}

// ---------------------------------------------------------------------------
// Lists, assocs, strings
// ---------------------------------------------------------------------------

#[test]
fn list_and_assoc_literals() {
    assert_eq!(eval_numbers("(list 1 (+ 1 1) 3)"), vec![1.0, 2.0, 3.0]);
    let (entity, result) = eval(r#"(associate "x" (+ 5 5) "y" 20)"#);
    let manager = entity.manager();
    let id = result.node_id().unwrap();
    assert_eq!(manager.kind_of(id), NodeKind::Assoc);
    let x = intern::pool().id_if_exists("x").unwrap();
    assert_eq!(manager.number_of(manager.mapped_get(id, x).unwrap()), 10.0);
}

#[test]
fn list_accessors() {
    assert_eq!(eval_number("(first (list 7 8 9))"), 7.0);
    assert_eq!(eval_number("(last (list 7 8 9))"), 9.0);
    assert_eq!(eval_numbers("(tail (list 1 2 3))"), vec![2.0, 3.0]);
    assert_eq!(eval_numbers("(trunc (list 1 2 3))"), vec![1.0, 2.0]);
    assert_eq!(eval_numbers("(tail (list 1 2 3 4) 2)"), vec![3.0, 4.0]);
    assert_eq!(eval_number("(size (list 1 2 3))"), 3.0);
    assert_eq!(eval_number("(size \"hello\")"), 5.0);
    assert_eq!(
        eval_numbers("(append (list 1) (list 2 3) 4)"),
        vec![1.0, 2.0, 3.0, 4.0]
    );
    assert_eq!(eval_numbers("(range 1 5)"), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(eval_numbers("(range 0 1 0.5)"), vec![0.0, 0.5, 1.0]);
    assert_eq!(eval_numbers("(reverse (list 1 2 3))"), vec![3.0, 2.0, 1.0]);
}

#[test]
fn get_and_set_traverse_paths() {
    assert_eq!(eval_number("(get (list 1 (list 2 3)) (list 1 0))"), 2.0);
    assert_eq!(
        eval_number(r#"(get (assoc "a" (assoc "b" 5)) (list "a" "b"))"#),
        5.0
    );
    assert_eq!(
        eval_number("(get (set (list 1 2 3) 1 9) 1)"),
        9.0
    );
}

#[test]
fn map_filter_reduce_sort() {
    assert_eq!(
        eval_numbers("(map (lambda (* (current_value) 2)) (list 1 2 3))"),
        vec![2.0, 4.0, 6.0]
    );
    assert_eq!(
        eval_numbers("(filter (lambda (> (current_value) 1)) (list 0 1 2 3))"),
        vec![2.0, 3.0]
    );
    assert_eq!(
        eval_number("(reduce (lambda (+ (previous_result) (current_value))) (list 1 2 3 4))"),
        10.0
    );
    assert_eq!(eval_numbers("(sort (list 3 1 2))"), vec![1.0, 2.0, 3.0]);
    assert_eq!(
        eval_numbers("(sort (lambda (- (previous_result) (current_value))) (list 3 1 2))"),
        vec![3.0, 2.0, 1.0]
    );
}

#[test]
fn map_exposes_index() {
    assert_eq!(
        eval_numbers("(map (lambda (current_index)) (list 9 9 9))"),
        vec![0.0, 1.0, 2.0]
    );
}

#[test]
fn weave_interleaves() {
    assert_eq!(
        eval_numbers("(weave (list 1 3 5) (list 2 4 6))"),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}

#[test]
fn apply_retypes_a_collection() {
    assert_eq!(eval_number(r#"(apply "+" (list 1 2 3))"#), 6.0);
}

#[test]
fn rewrite_maps_over_every_node() {
    // Double every number in the tree; non-numbers pass through unchanged.
    assert_eq!(
        eval_numbers(
            r#"(rewrite
                 (lambda
                   (if (~ (current_value) 0)
                       (* (current_value) 2)
                       (current_value)))
                 (list 1 2 3))"#
        ),
        vec![2.0, 4.0, 6.0]
    );
}

#[test]
fn assoc_manipulation() {
    assert_eq!(eval_number(r#"(size (indices (assoc "a" 1 "b" 2)))"#), 2.0);
    assert!(eval_bool(r#"(contains_index (assoc "a" 1) "a")"#));
    assert!(!eval_bool(r#"(contains_index (assoc "a" 1) "b")"#));
    assert!(eval_bool(r#"(contains_value (list 1 2 3) 2)"#));
    assert_eq!(
        eval_number(r#"(get (remove (assoc "a" 1 "b" 2) "a") "b")"#),
        2.0
    );
    assert_eq!(eval_number(r#"(size (keep (assoc "a" 1 "b" 2) "a"))"#), 1.0);
    assert_eq!(
        eval_number(r#"(get (zip (list "k1" "k2") (list 4 5)) "k2")"#),
        5.0
    );
    assert_eq!(
        eval_numbers(r#"(unzip (assoc "a" 1 "b" 2) (list "b" "a"))"#),
        vec![2.0, 1.0]
    );
}

#[test]
fn string_family() {
    assert_eq!(eval_string(r#"(concat "foo" "bar" 7)"#), "foobar7");
    assert_eq!(eval_string(r#"(substr "abcdef" 2 3)"#), "cde");
    assert_eq!(eval_number(r#"(size (explode "abc"))"#), 3.0);
    assert_eq!(eval_number(r#"(size (split "a,b,c" ","))"#), 3.0);
    assert_eq!(eval_string(r#"(reverse "abc")"#), "cba");
}

// ---------------------------------------------------------------------------
// Logic and equivalence
// ---------------------------------------------------------------------------

#[test]
fn logic_family() {
    assert!(eval_bool("(and (true) 1)"));
    assert!(!eval_bool("(and (true) (false))"));
    assert!(eval_bool("(or (false) 2)"));
    assert!(!eval_bool("(or (false) (false))"));
    assert!(eval_bool("(xor (true) (false) (false))"));
    assert!(!eval_bool("(xor (true) (true))"));
    assert!(eval_bool("(not (false))"));
}

#[test]
fn equality_and_comparison() {
    assert!(eval_bool("(= 2 2 2)"));
    assert!(!eval_bool("(= 2 3)"));
    assert!(eval_bool(r#"(= (list 1 2) (list 1 2))"#));
    assert!(eval_bool("(!= 1 2 3)"));
    assert!(!eval_bool("(!= 1 2 1)"));
    assert!(eval_bool("(< 1 2 3)"));
    assert!(!eval_bool("(< 1 3 2)"));
    assert!(eval_bool("(<= 1 1 2)"));
    assert!(eval_bool("(> 3 2 1)"));
    assert!(eval_bool(r#"(~ 1 2.5)"#));
    assert!(eval_bool(r#"(!~ 1 "s" (list))"#));
}

#[test]
fn type_opcodes() {
    assert_eq!(eval_string("(get_type_string (list 1))"), "list");
    assert_eq!(eval_string(r#"(get_type_string "x")"#), "string");
    // set_type produces code, not a computed value.
    assert_eq!(
        eval_string(r#"(get_type_string (set_type (list 2 3) "+"))"#),
        "+"
    );
}

#[test]
fn format_converts_between_renderings() {
    assert_eq!(eval_number(r#"(format "12.5" "string" "number")"#), 12.5);
    assert_eq!(eval_string(r#"(format 12.5 "number" "string")"#), "12.5");
    let json = eval_string(r#"(format (assoc "a" 1) "code" "json")"#);
    assert!(json.contains("\"a\""));
    assert_eq!(
        eval_number(r#"(get (format "{\"a\": 3}" "json" "code") "a")"#),
        3.0
    );
}

// ---------------------------------------------------------------------------
// Labels, comments, metadata
// ---------------------------------------------------------------------------

#[test]
fn labels_roundtrip_through_opcodes() {
    assert_eq!(
        eval_string(r#"(first (get_labels (first (list #tagged 5))))"#),
        "tagged"
    );
    assert_eq!(
        eval_string(r#"(first (get_labels (set_labels 5 (list "fresh"))))"#),
        "fresh"
    );
}

#[test]
fn comments_attach_and_read() {
    assert_eq!(
        eval_string(r#"(get_comments (set_comments 5 "a note"))"#),
        "a note"
    );
}

#[test]
fn concurrency_flag_roundtrip() {
    assert!(eval_bool(r#"(get_concurrency (set_concurrency (list 1 2) (true)))"#));
    assert!(!eval_bool(r#"(get_concurrency (list 1 2))"#));
}

#[test]
fn get_value_strips_metadata() {
    assert_eq!(
        eval_number(r#"(size (get_labels (get_value (first (list #tagged 5)))))"#),
        0.0
    );
}

// ---------------------------------------------------------------------------
// Tree merging
// ---------------------------------------------------------------------------

#[test]
fn tree_merge_family() {
    assert_eq!(eval_number("(total_size (list 1 (list 2 3)))"), 5.0);
    assert_eq!(eval_number("(commonality (list 1 2 3) (list 1 2 4))"), 3.0);
    assert_eq!(eval_number("(edit_distance (list 1 2) (list 1 2))"), 0.0);
    assert_eq!(
        eval_number(r#"(get (intersect (assoc "x" 1 "y" 2) (assoc "x" 1)) "x")"#),
        1.0
    );
    assert_eq!(
        eval_number(r#"(size (union (assoc "x" 1) (assoc "y" 2)))"#),
        2.0
    );
}

#[test]
fn mix_is_one_of_the_inputs_at_extremes() {
    assert_eq!(eval_numbers("(mix (list 1 2) (list 8 9) 1)"), vec![1.0, 2.0]);
    assert_eq!(eval_numbers("(mix (list 1 2) (list 8 9) 0)"), vec![8.0, 9.0]);
}

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

#[test]
fn rand_is_deterministic_per_seed() {
    let a = eval_number("(rand)");
    let b = eval_number("(rand)");
    // Fresh entities with the same seed draw the same stream.
    assert_eq!(a, b);
    assert!((0.0..1.0).contains(&a));
}

#[test]
fn rand_picks_list_elements() {
    let v = eval_number("(rand (list 5 6 7))");
    assert!([5.0, 6.0, 7.0].contains(&v));
}

#[test]
fn weighted_rand_honors_certainty() {
    assert_eq!(eval_string(r#"(weighted_rand (assoc "only" 1))"#), "only");
}

#[test]
fn rand_seed_roundtrip() {
    assert_eq!(eval_string(r#"(seq (set_rand_seed "abc") (get_rand_seed))"#), "abc");
}

// ---------------------------------------------------------------------------
// Crypto opcodes
// ---------------------------------------------------------------------------

#[test]
fn sign_verify_encrypt_decrypt() {
    assert!(eval_bool(
        r#"(crypto_sign_verify "msg" "key" (crypto_sign "msg" "key"))"#
    ));
    assert!(!eval_bool(
        r#"(crypto_sign_verify "msg" "other" (crypto_sign "msg" "key"))"#
    ));
    assert_eq!(
        eval_string(r#"(decrypt (encrypt "secret" "k" "n") "k" "n")"#),
        "secret"
    );
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[test]
fn sandboxed_infinite_loop_exhausts_its_budget() {
    // The budget is the cancellation mechanism: the loop yields null.
    let (_, result) = eval(r#"(call_sandboxed (lambda (while (true) 1)) (assoc) 100)"#);
    assert!(result.is_null());
}

#[test]
fn step_budget_aborts_and_stays_exhausted() {
    let entity = Entity::with_seed("budget", "seed");
    let program = parser::parse(
        "(while (true) 1)",
        entity.manager(),
        "test",
        false,
    )
    .unwrap();
    entity.set_root(Some(program));

    let constraints = Arc::new(PerformanceConstraints {
        max_execution_steps: 100,
        ..Default::default()
    });
    let mut interpreter = Interpreter::new(&entity);
    interpreter.set_constraints(Some(constraints.clone()));
    let result = interpreter.execute(program, true);

    assert!(result.is_null());
    let steps = constraints.cur_execution_step.load(Ordering::Relaxed);
    assert!(steps > 100, "counter should reach the budget, got {}", steps);
    // Counters stay exhausted so enclosing evaluations abort too.
    let again = interpreter.execute(program, true);
    assert!(again.is_null());
}

#[test]
fn unparse_parse_through_opcodes() {
    assert_eq!(eval_number(r#"(+ 1 (parse "2"))"#), 3.0);
    // lambda yields its body unevaluated; unparse renders that body.
    assert_eq!(eval_string(r#"(unparse (lambda (+ 1 2)))"#), "(+ 1 2)");
}
