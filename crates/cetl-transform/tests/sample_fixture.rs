use std::path::Path;

use cetl_core::AgeGroup;
use cetl_transform::transform;

fn fixture_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample/customers.json")
}

#[test]
fn sample_fixture_transforms_into_expected_brackets() {
    let text = std::fs::read_to_string(fixture_path()).expect("reading sample fixture");
    let value: serde_json::Value = serde_json::from_str(&text).expect("parsing sample fixture");

    let batch = transform(Some(value)).unwrap().unwrap();
    let actual: Vec<_> = batch
        .iter()
        .map(|r| (r.id(), r.name().unwrap().to_string(), r.age_group()))
        .collect();

    assert_eq!(
        actual,
        vec![
            (1, "Alice".to_string(), AgeGroup::Youth),
            (2, "Bob".to_string(), AgeGroup::Senior),
            (3, "Charlie".to_string(), AgeGroup::Adult),
            (4, "Diana".to_string(), AgeGroup::Adult),
            (5, "Ethan".to_string(), AgeGroup::Senior),
            (6, "Fiona".to_string(), AgeGroup::Youth),
        ]
    );
}
