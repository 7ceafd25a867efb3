//! Entity persistence: store, destroy in memory, reload, and read back —
//! plus metadata contents, the version gate, filename escaping on disk, and
//! the compressed code format.

use std::sync::Arc;

use sylva::entity::Entity;
use sylva::interpreter::Interpreter;
use sylva::node_manager::NodeManager;
use sylva::value::Immediate;
use sylva::{asset, parser, NodeKind};

fn entity_with_root(id: &str, seed: &str, source: &str) -> Arc<Entity> {
    let entity = Entity::with_seed(id, seed);
    let root = parser::parse(source, entity.manager(), "root", false).unwrap();
    entity.set_root(Some(root));
    entity
}

#[test]
fn store_reload_retrieve() {
    // Full persistence cycle: store, drop the in-memory copy, reload, read.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("A.syl");

    let world = Entity::with_seed("world", "world-seed");
    let a = entity_with_root("A", "a-seed", r#"(associate "v" 42)"#);
    world.add_child("A", a.clone());
    asset::store_entity(&a, &path).unwrap();

    // Destroy the in-memory copy.
    world.remove_child("A");
    drop(a);

    // Reload from disk and reattach.
    let reloaded = asset::load_entity(&path, "fallback-seed", false).unwrap();
    world.add_child("A", reloaded);

    let program = parser::parse(
        r#"(retrieve_from_entity "A" "v")"#,
        world.manager(),
        "test",
        false,
    )
    .unwrap();
    world.set_root(Some(program));
    let mut interpreter = Interpreter::new(&world);
    let result = interpreter.execute(program, true);
    let value = match result.value {
        Immediate::Number(v) => v,
        Immediate::Node(id) => world.manager().number_of(id),
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(value, 42.0);
}

#[test]
fn metadata_contains_seed_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.syl");
    let entity = entity_with_root("meta", "meta-seed", "(list 1 2)");
    asset::store_entity(&entity, &path).unwrap();

    let metadata_path = dir.path().join("meta.metadata");
    assert!(metadata_path.exists());

    let manager = Arc::new(NodeManager::new());
    let (metadata, status) = asset::load_resource(&metadata_path, &manager);
    assert!(status.loaded, "{}", status.message);
    let metadata = metadata.unwrap();
    assert_eq!(manager.kind_of(metadata), NodeKind::Assoc);

    let seed_key = sylva::intern::intern("rand_seed");
    let seed = manager.mapped_get(metadata, seed_key).unwrap();
    assert_eq!(sylva::intern::text(manager.symbol_of(seed)), "meta-seed");

    let version_key = sylva::intern::intern("version");
    let version = manager.mapped_get(metadata, version_key).unwrap();
    let text = sylva::intern::text(manager.symbol_of(version));
    let fields: Vec<&str> = text.split('.').collect();
    assert_eq!(fields.len(), 3, "version {:?} is not a triple", text);
    assert!(fields.iter().all(|f| f.parse::<u32>().is_ok()));
}

#[test]
fn reload_restores_stored_seed_over_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seeded.syl");
    let entity = entity_with_root("seeded", "the-real-seed", "(null)");
    asset::store_entity(&entity, &path).unwrap();

    let reloaded = asset::load_entity(&path, "ignored-default", false).unwrap();
    assert_eq!(reloaded.rand_seed(), "the-real-seed");
}

#[test]
fn newer_version_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.syl");
    let entity = entity_with_root("future", "seed", "(list)");
    asset::store_entity(&entity, &path).unwrap();

    // Rewrite the metadata claiming a newer engine.
    let (major, minor, patch) = sylva::engine_version();
    let metadata_path = dir.path().join("future.metadata");
    std::fs::write(
        &metadata_path,
        format!(
            "(assoc rand_seed \"seed\" version \"{}.{}.{}\")\n",
            major, minor, patch + 1
        ),
    )
    .unwrap();

    let status = asset::load_entity(&path, "seed", false).unwrap_err();
    assert!(!status.loaded);
    assert!(
        status.message.contains("more recent"),
        "unexpected message {:?}",
        status.message
    );
}

#[test]
fn children_persist_under_escaped_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parent.syl");

    let parent = entity_with_root("parent", "p-seed", "(null)");
    let child = entity_with_root("needs escaping!", "c-seed", r#"(associate "k" 7)"#);
    parent.add_child("needs escaping!", child);
    asset::store_entity(&parent, &path).unwrap();

    // The child file name must be filesystem-safe.
    let child_dir = dir.path().join("parent");
    let entries: Vec<String> = std::fs::read_dir(&child_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].contains(' '));
    assert!(!entries[0].contains('!'));

    let reloaded = asset::load_entity(&path, "seed", false).unwrap();
    let child = reloaded.child("needs escaping!").expect("child reattached");
    let program = parser::parse(r#"(retrieve "k")"#, child.manager(), "t", false).unwrap();
    child.manager().keep_node_reference(program);
    let mut interpreter = Interpreter::new(&child);
    let result = interpreter.execute(program, true);
    let value = match result.value {
        Immediate::Number(v) => v,
        Immediate::Node(id) => child.manager().number_of(id),
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(value, 7.0);
}

#[test]
fn destroy_stored_entity_removes_all_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone.syl");
    let parent = entity_with_root("gone", "seed", "(null)");
    parent.add_child("kid", entity_with_root("kid", "seed2", "(null)"));
    asset::store_entity(&parent, &path).unwrap();
    assert!(path.exists());
    assert!(dir.path().join("gone").is_dir());

    asset::destroy_stored_entity(&path).unwrap();
    assert!(!path.exists());
    assert!(!dir.path().join("gone.metadata").exists());
    assert!(!dir.path().join("gone").exists());
}

#[test]
fn compressed_code_roundtrips_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("code.csyl");

    let manager = Arc::new(NodeManager::new());
    let node = parser::parse(
        r#"(seq (print "hello") (print "hello") (+ 1 2))"#,
        &manager,
        "t",
        false,
    )
    .unwrap();
    manager.set_root(Some(node));
    asset::store_resource(&manager, node, &path, false).unwrap();

    let other = Arc::new(NodeManager::new());
    let (loaded, status) = asset::load_resource(&path, &other);
    assert!(status.loaded, "{}", status.message);
    assert!(sylva::tree::deep_equal(&manager, node, &other, loaded.unwrap()));
}

#[test]
fn raw_extension_loads_as_string() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "plain text").unwrap();

    let manager = Arc::new(NodeManager::new());
    let (node, status) = asset::load_resource(&path, &manager);
    assert!(status.loaded);
    let node = node.unwrap();
    assert_eq!(manager.kind_of(node), NodeKind::String);
    assert_eq!(sylva::intern::text(manager.symbol_of(node)), "plain text");
}

#[test]
fn load_entity_opcode_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("B.syl");
    let b = entity_with_root("B", "b-seed", r#"(associate "w" 9)"#);
    asset::store_entity(&b, &path).unwrap();
    drop(b);

    let world = Entity::with_seed("world", "w-seed");
    let source = format!(
        r#"(seq (load_entity "{}" "B") (retrieve_from_entity "B" "w"))"#,
        path.display()
    );
    let program = parser::parse(&source, world.manager(), "test", false).unwrap();
    world.set_root(Some(program));
    let mut interpreter = Interpreter::new(&world);
    let result = interpreter.execute(program, true);
    let value = match result.value {
        Immediate::Number(v) => v,
        Immediate::Node(id) => world.manager().number_of(id),
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(value, 9.0);
}
