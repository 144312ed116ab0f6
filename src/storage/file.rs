use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Commit, Stage, Storage};
use crate::error::{Result, StrataError};
use crate::tree::{Address, Page};

const PAGES: &str = "pages";
const JOURNAL: &str = "journal";
const CHECKSUM_LEN: usize = 4;

/// Directory of checksummed page files.
///
/// Each page lives in `pages/<address>.page` and is replaced through a
/// temporary file and a rename. A commit is first published as a single
/// checksummed journal file; the pages are then rewritten and the journal
/// removed. Opening the directory replays a complete journal and discards a
/// torn one, so a crash leaves either the old or the new structure.
pub struct FileStorage {
    directory: PathBuf,
    commits: Mutex<()>,
}

impl FileStorage {
    /// Opens (creating if needed) storage rooted at `directory` and
    /// recovers any interrupted commit.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(directory.join(PAGES))?;
        let storage = Self {
            directory,
            commits: Mutex::new(()),
        };
        storage.recover()?;
        Ok(storage)
    }

    /// Root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn page_path(&self, address: Address) -> PathBuf {
        self.directory
            .join(PAGES)
            .join(format!("{}.page", address.0))
    }

    fn journal_path(&self) -> PathBuf {
        self.directory.join(JOURNAL)
    }

    fn read_page(&self, address: Address) -> Result<Page> {
        let bytes = match fs::read(self.page_path(address)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StrataError::NotFound(address))
            }
            Err(err) => return Err(err.into()),
        };
        let page: Page = decode(&bytes)?;
        if page.address() != address {
            return Err(StrataError::Corruption(format!(
                "page file {address} holds page {}",
                page.address()
            )));
        }
        Ok(page)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        replace(&self.page_path(page.address()), &encode(page)?)
    }

    fn apply(&self, stages: Vec<Stage>) -> Result<()> {
        for stage in stages {
            match stage {
                Stage::WriteBranch(page) | Stage::RewriteLeaf(page) => self.write_page(&page)?,
                Stage::Unlink(address) => remove_if_exists(&self.page_path(address))?,
            }
        }
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let path = self.journal_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match decode::<Commit>(&bytes) {
            Ok(commit) => {
                debug!(stages = commit.stages().len(), "storage.replay_journal");
                self.apply(commit.into_stages())?;
            }
            Err(err) => warn!(error = %err, "storage.discard_torn_journal"),
        }
        remove_if_exists(&path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_leaf(&self, address: Address) -> Result<Page> {
        self.read_page(address)
    }

    fn read_branch(&self, address: Address) -> Result<Page> {
        self.read_page(address)
    }

    fn write_leaf(&self, page: &Page) -> Result<()> {
        self.write_page(page)
    }

    fn commit(&self, commit: Commit) -> Result<()> {
        if commit.is_empty() {
            return Ok(());
        }
        let _serial = self.commits.lock();
        replace(&self.journal_path(), &encode(&commit)?)?;
        self.apply(commit.into_stages())?;
        remove_if_exists(&self.journal_path())?;
        Ok(())
    }

    fn high_water(&self) -> Result<Option<Address>> {
        let mut high = None;
        for entry in fs::read_dir(self.directory.join(PAGES))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("page") {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok());
            if let Some(value) = parsed {
                high = high.max(Some(Address(value)));
            }
        }
        Ok(high)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    let mut bytes = Vec::with_capacity(CHECKSUM_LEN + body.len());
    bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(StrataError::Corruption("truncated envelope".into()));
    }
    let (checksum, body) = bytes.split_at(CHECKSUM_LEN);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(checksum);
    let actual = crc32fast::hash(body);
    if u32::from_be_bytes(expected) != actual {
        return Err(StrataError::Corruption(format!(
            "checksum mismatch: stored {}, computed {}",
            hex::encode(expected),
            hex::encode(actual.to_be_bytes())
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

fn replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
