use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DATA_DIR: &str = "log";
const META_DIR: &str = "meta";
const TMP_SUFFIX: &str = ".tmp";

/// Directory tree of one engine, rooted at `<root>/<stream_id>/`.
#[derive(Debug, Clone)]
pub struct EngineLayout {
    stream_root: PathBuf,
}

impl EngineLayout {
    pub fn new(root: impl AsRef<Path>, stream_id: u64) -> Self {
        Self {
            stream_root: root.as_ref().join(stream_id.to_string()),
        }
    }

    pub fn paths(&self) -> EnginePaths {
        EnginePaths {
            stream_root: self.stream_root.clone(),
            data_dir: self.stream_root.join(DATA_DIR),
            meta_dir: self.stream_root.join(META_DIR),
        }
    }

    pub fn ensure(&self) -> io::Result<()> {
        let paths = self.paths();
        fs::create_dir_all(&paths.data_dir)?;
        fs::create_dir_all(&paths.meta_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub stream_root: PathBuf,
    pub data_dir: PathBuf,
    pub meta_dir: PathBuf,
}

pub fn block_path(dir: &Path, block_id: u64) -> PathBuf {
    dir.join(block_id.to_string())
}

/// Block ids present in `dir`, ascending. Temporary and non-numeric names are
/// skipped.
pub fn discover_blocks(dir: &Path) -> io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(id) = parse_block_id(&entry.file_name()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// First id missing from an ascending id list, if the sequence has a hole.
pub fn first_gap(ids: &[u64]) -> Option<u64> {
    ids.windows(2)
        .find(|pair| pair[1] != pair[0] + 1)
        .map(|pair| pair[0] + 1)
}

fn parse_block_id(name: &OsStr) -> Option<u64> {
    let name = name.to_str()?;
    if name.ends_with(TMP_SUFFIX) || name.is_empty() {
        return None;
    }
    if !name.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
