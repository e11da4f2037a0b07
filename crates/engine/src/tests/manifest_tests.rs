use crate::{Manifest, ManifestTier, MANIFEST_FILENAME, MANIFEST_TMP_FILENAME};
use anyhow::Result;
use tempfile::tempdir;

fn sample() -> Manifest {
    Manifest {
        tiers: vec![
            ManifestTier {
                level: 0,
                segments: vec!["sst_0004.db".into(), "sst_0005.db".into()],
            },
            ManifestTier {
                level: 1,
                segments: vec!["sst_0003.db".into()],
            },
        ],
        active_wal: "wal_0006.log".into(),
        next_entry_id: 7,
    }
}

#[test]
fn write_then_load_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let manifest = sample();

    manifest.write(dir.path())?;
    let loaded = Manifest::load(dir.path())?.expect("manifest exists");
    assert_eq!(loaded, manifest);
    Ok(())
}

#[test]
fn json_document_uses_the_documented_field_names() -> Result<()> {
    let dir = tempdir()?;
    sample().write(dir.path())?;

    let raw = std::fs::read_to_string(dir.path().join(MANIFEST_FILENAME))?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;

    assert_eq!(value["active_wal"], "wal_0006.log");
    assert_eq!(value["next_entry_id"], 7);
    assert_eq!(value["tiers"][0]["level"], 0);
    assert_eq!(value["tiers"][0]["segments"][1], "sst_0005.db");
    assert_eq!(value["tiers"][1]["level"], 1);
    Ok(())
}

#[test]
fn load_missing_manifest_returns_none() -> Result<()> {
    let dir = tempdir()?;
    assert!(Manifest::load(dir.path())?.is_none());
    Ok(())
}

#[test]
fn load_rejects_malformed_json() -> Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join(MANIFEST_FILENAME), b"{\"tiers\": [")?;
    assert!(Manifest::load(dir.path()).is_err());
    Ok(())
}

#[test]
fn rewrite_replaces_previous_content() -> Result<()> {
    let dir = tempdir()?;

    let mut manifest = sample();
    manifest.write(dir.path())?;

    manifest.next_entry_id = 42;
    manifest.tiers.pop();
    manifest.write(dir.path())?;

    let loaded = Manifest::load(dir.path())?.expect("manifest exists");
    assert_eq!(loaded.next_entry_id, 42);
    assert_eq!(loaded.tiers.len(), 1);
    Ok(())
}

#[test]
fn write_leaves_no_temp_file_behind() -> Result<()> {
    let dir = tempdir()?;
    sample().write(dir.path())?;
    assert!(dir.path().join(MANIFEST_FILENAME).exists());
    assert!(!dir.path().join(MANIFEST_TMP_FILENAME).exists());
    Ok(())
}

#[test]
fn empty_manifest_is_serializable() -> Result<()> {
    let dir = tempdir()?;
    let manifest = Manifest::default();
    manifest.write(dir.path())?;

    let loaded = Manifest::load(dir.path())?.expect("manifest exists");
    assert_eq!(loaded, manifest);
    assert!(loaded.tiers.is_empty());
    assert_eq!(loaded.next_entry_id, 0);
    Ok(())
}
