//! On-disk cache of discovered block attributes.
//!
//! Probing a large signal graph takes a long time, so the result can be
//! persisted and reloaded on the next start as long as the device still
//! looks like the one that was probed.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Block, Device};

/// Directory cache documents are written to by default
pub const DEFAULT_DIR: &str = ".cache";

/// Reason a cache document could not be adopted
#[derive(Debug, Error)]
pub enum Error {
    /// IO error reading or writing the document
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Document is not valid JSON of the expected shape
    #[error("cache format error: {0}")]
    Format(#[from] serde_json::Error),
    /// Cached hostname differs from the live device
    #[error("hostname mismatch")]
    HostnameMismatch,
    /// Cached firmware version differs from the live device
    #[error("firmware version mismatch")]
    FirmwareMismatch,
    /// Cached alias count differs from the live device
    #[error("alias count mismatch")]
    AliasCountMismatch,
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    hostname: String,
    firmware: String,
    #[serde(rename = "nAliases")]
    n_aliases: usize,
    blocks: BTreeMap<String, Block>,
}

/// Load cached blocks after checking the document still matches the device
pub fn load(
    path: &Path,
    hostname: &str,
    firmware: &str,
    n_aliases: usize,
) -> Result<Vec<Block>, Error> {
    let doc: Document = serde_json::from_str(&fs::read_to_string(path)?)?;
    if doc.hostname != hostname {
        return Err(Error::HostnameMismatch);
    }
    if doc.firmware != firmware {
        return Err(Error::FirmwareMismatch);
    }
    if doc.n_aliases != n_aliases {
        return Err(Error::AliasCountMismatch);
    }
    Ok(doc
        .blocks
        .into_iter()
        .map(|(id, mut block)| {
            block.id = id;
            block
        })
        .collect())
}

/// Persist the probed model as `<dir>/<hostname>.cdspblk`
pub fn save(dir: &Path, device: &Device) -> Result<PathBuf, Error> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.cdspblk", device.hostname));
    let doc = Document {
        hostname: device.hostname.clone(),
        firmware: device.firmware.clone(),
        n_aliases: device.aliases.len(),
        blocks: device
            .blocks
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect(),
    };
    fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
    Ok(path)
}
