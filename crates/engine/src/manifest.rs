//! # Manifest — authoritative tier/WAL layout
//!
//! The manifest is a JSON document describing which segment files belong to
//! which tier, which WAL file is active, and the next entry id used to name
//! new files:
//!
//! ```json
//! {
//!   "tiers": [
//!     {"level": 0, "segments": ["sst_0004.db", "sst_0005.db"]},
//!     {"level": 1, "segments": ["sst_0003.db"]}
//!   ],
//!   "active_wal": "wal_0006.log",
//!   "next_entry_id": 7
//! }
//! ```
//!
//! Any `.db`/`.idx`/`.log` file in the data directory that the manifest does
//! not reference is an orphan and is deleted on startup; the set of files it
//! references is therefore exactly the set of live files.
//!
//! ## Crash Safety
//!
//! The manifest is rewritten atomically: serialize to `MANIFEST.tmp`, fsync,
//! rename over `MANIFEST`. A failed rename leaves the prior manifest
//! authoritative and removes the temp file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

/// Name of the manifest file within the data directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

/// Temporary file used during atomic manifest writes.
pub const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// One tier's worth of segment filenames, newest last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTier {
    pub level: usize,
    pub segments: Vec<String>,
}

/// On-disk description of the engine's tier layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub tiers: Vec<ManifestTier>,
    pub active_wal: String,
    pub next_entry_id: u64,
}

impl Manifest {
    /// Loads the manifest from `dir`, returning `None` when the file does
    /// not exist. A manifest that exists but cannot be parsed is a startup
    /// error, not a fresh database.
    pub fn load(dir: &Path) -> Result<Option<Manifest>> {
        let path = dir.join(MANIFEST_FILENAME);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::anyhow!(e)
                    .context(format!("failed to open manifest at {}", path.display())))
            }
        };

        let manifest = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse manifest at {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Persists the manifest atomically: write `MANIFEST.tmp`, fsync, rename
    /// over `MANIFEST`. On any failure the temp file is removed and the
    /// previous manifest stays authoritative.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let tmp_path = dir.join(MANIFEST_TMP_FILENAME);
        let path = dir.join(MANIFEST_FILENAME);

        let result = (|| -> Result<()> {
            let mut f = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            serde_json::to_writer(&mut f, self)?;
            f.sync_all()?;
            fs::rename(&tmp_path, &path)
                .with_context(|| format!("failed to rename manifest into {}", path.display()))?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}
