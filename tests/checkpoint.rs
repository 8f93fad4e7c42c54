use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use taxon_enricher::checkpoint::Checkpoint;
use taxon_enricher::error::EnrichError;

fn path_in(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
}

#[test]
fn missing_file_is_an_empty_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = Checkpoint::load(path_in(&dir, "absent.json")).unwrap();
    assert!(checkpoint.is_empty());
    assert!(!checkpoint.is_done("Panthera pardus"));
}

#[test]
fn marks_survive_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_in(&dir, "nested/.import_checkpoint.json");

    let checkpoint = Checkpoint::load(path.clone()).unwrap();
    checkpoint.mark_done("Panthera pardus").unwrap();
    checkpoint.mark_done("id:42").unwrap();
    checkpoint.mark_done("Panthera pardus").unwrap();
    drop(checkpoint);

    let reloaded = Checkpoint::load(path.clone()).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert!(reloaded.is_done("id:42"));

    let leftovers = fs::read_dir(path.parent().unwrap().as_std_path())
        .unwrap()
        .count();
    assert_eq!(leftovers, 1);
}

#[test]
fn existing_file_format_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_in(&dir, "cp.json");
    fs::write(
        path.as_std_path(),
        r#"{"done": {"Lynx lynx": true, "Canis lupus": false}}"#,
    )
    .unwrap();

    let checkpoint = Checkpoint::load(path).unwrap();
    assert!(checkpoint.is_done("Lynx lynx"));
    assert!(!checkpoint.is_done("Canis lupus"));
    assert_eq!(checkpoint.len(), 1);
}

#[test]
fn corrupt_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_in(&dir, "cp.json");
    fs::write(path.as_std_path(), "{not json").unwrap();

    assert_matches!(Checkpoint::load(path), Err(EnrichError::Checkpoint(_)));
}
