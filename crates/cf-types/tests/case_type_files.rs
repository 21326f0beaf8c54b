use std::path::PathBuf;

use cf_types::*;

fn case_types_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("case_types")
}

#[test]
fn shipped_case_types_load() {
    let registry = CaseTypeRegistry::load_dir(&case_types_dir()).unwrap();
    let names: Vec<_> = registry.names().collect();
    assert_eq!(names, vec!["2D Bridge Deck", "2D Shape"]);

    let shape = registry.get("2D Shape").unwrap();
    assert_eq!(shape.stages.len(), 3);
    assert_eq!(shape.stage_of_kind(StageKind::Solve).unwrap().id, "sim");
    assert_eq!(
        shape.default_params().get("turbulence_model").map(String::as_str),
        Some("kEpsilon")
    );
}

#[test]
fn stages_from_includes_dependents() {
    let registry = CaseTypeRegistry::load_dir(&case_types_dir()).unwrap();
    let shape = registry.get("2D Shape").unwrap();
    let ids: Vec<_> = shape.stages_from("sim").iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["sim", "post"]);
    assert!(shape.stages_from("nope").is_empty());
    assert_eq!(shape.stages_before("post").len(), 2);
}

#[test]
fn yaml_round_trip_through_disk() {
    let registry = CaseTypeRegistry::load_dir(&case_types_dir()).unwrap();
    let deck = registry.get("2D Bridge Deck").unwrap();

    let dir = std::env::temp_dir().join("cf_types_roundtrip");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("deck.yaml");
    save_yaml(&path, &deck).unwrap();

    let loaded = load_file(&path).unwrap();
    assert_eq!(&loaded, deck.as_ref());
}

#[test]
fn duplicate_names_are_rejected() {
    let registry = CaseTypeRegistry::load_dir(&case_types_dir()).unwrap();
    let mut copy = CaseTypeRegistry::new();
    let shape = registry.get("2D Shape").unwrap();
    copy.insert(shape.as_ref().clone()).unwrap();
    assert!(matches!(
        copy.insert(shape.as_ref().clone()),
        Err(TypeError::DuplicateType { .. })
    ));
}

#[test]
fn unknown_extension_is_unsupported() {
    let dir = std::env::temp_dir().join("cf_types_ext");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("notes.txt");
    std::fs::write(&path, "hello").unwrap();
    assert!(matches!(
        load_file(&path),
        Err(TypeError::UnsupportedFile { .. })
    ));
}
