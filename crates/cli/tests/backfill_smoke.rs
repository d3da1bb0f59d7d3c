use std::process::Command;
use tidemark::store::RedbStore;
use tidemark::{EntityKey, TableDescriptor, VersionRecord, VersionStore};

fn seed(path: &str, table: &TableDescriptor) {
    let store = RedbStore::open(path).unwrap();
    for (tx, name) in [(1_u64, "A"), (3, "A"), (7, "B")] {
        store
            .insert_row(
                table,
                VersionRecord::new(EntityKey::single(1), tx).with_attribute("name", name),
            )
            .unwrap();
    }
}

#[test]
fn boundaries_subcommand_backfills_and_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("history.tidemark");
    let path_str = path.to_str().unwrap();
    let table = TableDescriptor::new("article_version", ["id"]);
    seed(path_str, &table);

    let output = Command::new(env!("CARGO_BIN_EXE_tidemark"))
        .args([
            "boundaries",
            "--db",
            path_str,
            "--table",
            "article_version",
            "--key-column",
            "id",
        ])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("rows processed: 3"), "stdout: {stdout}");
    assert!(stdout.contains("rows updated: 2"), "stdout: {stdout}");

    let store = RedbStore::open(path_str).unwrap();
    let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
    let ends: Vec<Option<u64>> = rows.iter().map(|r| r.end_transaction_id).collect();
    assert_eq!(ends, vec![Some(3), Some(7), None]);
}

#[test]
fn flags_subcommand_backfills_tracked_columns() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("history.tidemark");
    let path_str = path.to_str().unwrap();
    let table = TableDescriptor::new("article_version", ["id"]);
    seed(path_str, &table);

    let output = Command::new(env!("CARGO_BIN_EXE_tidemark"))
        .args([
            "flags",
            "--db",
            path_str,
            "--table",
            "article_version",
            "--key-column",
            "id",
            "--track",
            "name",
        ])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Only true flags are persisted: tx 1 (first version) and tx 7 (changed).
    assert!(stdout.contains("rows updated: 2"), "stdout: {stdout}");

    let store = RedbStore::open(path_str).unwrap();
    let rows = store.ordered_versions(&table, &EntityKey::single(1)).unwrap();
    let mods: Vec<bool> = rows.iter().map(|r| r.flag("name_mod")).collect();
    assert_eq!(mods, vec![true, false, true]);
}

#[test]
fn rerunning_both_backfills_updates_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("history.tidemark");
    let path_str = path.to_str().unwrap();
    seed(path_str, &TableDescriptor::new("article_version", ["id"]));

    let base = [
        "--db",
        path_str,
        "--table",
        "article_version",
        "--key-column",
        "id",
    ];
    let bin = env!("CARGO_BIN_EXE_tidemark");

    let mut boundaries: Vec<&str> = vec!["boundaries"];
    boundaries.extend_from_slice(&base);
    let mut flags: Vec<&str> = vec!["flags"];
    flags.extend_from_slice(&base);
    flags.extend_from_slice(&["--track", "name"]);

    for args in [&boundaries, &flags] {
        let first = Command::new(bin).args(args.iter()).output().unwrap();
        assert!(first.status.success());
        let second = Command::new(bin).args(args.iter()).output().unwrap();
        assert!(second.status.success());
        let stdout = String::from_utf8_lossy(&second.stdout);
        assert!(stdout.contains("rows updated: 0"), "stdout: {stdout}");
    }
}
