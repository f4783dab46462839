//! Write-ahead log adapters
//!
//! `FileWal` stores frames `[index u64 LE][len u32 LE][data]` in one
//! append-only file. Every write is synced before it returns. A torn frame
//! at the tail (crash mid-write) is cut off on open; anything else that does
//! not parse is reported as corruption.

use crate::ports::{WalError, WriteAheadLog};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const FRAME_HEADER_LEN: usize = 12;

struct FileWalInner {
    file: File,
    entries: BTreeMap<u64, Vec<u8>>,
}

pub struct FileWal {
    path: PathBuf,
    inner: Mutex<FileWalInner>,
}

impl FileWal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let (entries, valid_len) = parse_frames(&raw)?;
        if valid_len < raw.len() {
            warn!(
                "[hotstuff-wal] cutting {} torn bytes off {}",
                raw.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        info!(
            "[hotstuff-wal] opened {} with {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            inner: Mutex::new(FileWalInner { file, entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(index: u64, data: &[u8], out: &mut Vec<u8>) -> Result<(), WalError> {
    let len = u32::try_from(data.len())
        .map_err(|_| WalError::Corrupted(format!("entry {} too large", index)))?;
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Returns the parsed entries and the byte length of the intact prefix.
fn parse_frames(raw: &[u8]) -> Result<(BTreeMap<u64, Vec<u8>>, usize), WalError> {
    let mut entries = BTreeMap::new();
    let mut offset = 0;
    let mut last: Option<u64> = None;
    while raw.len() - offset >= FRAME_HEADER_LEN {
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&raw[offset..offset + 8]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&raw[offset + 8..offset + FRAME_HEADER_LEN]);
        let index = u64::from_le_bytes(index_bytes);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let start = offset + FRAME_HEADER_LEN;
        if raw.len() - start < len {
            break;
        }
        if let Some(prev) = last {
            if index != prev + 1 {
                return Err(WalError::Corrupted(format!(
                    "entry {} follows entry {}",
                    index, prev
                )));
            }
        }
        entries.insert(index, raw[start..start + len].to_vec());
        last = Some(index);
        offset = start + len;
    }
    Ok((entries, offset))
}

fn check_next(entries: &BTreeMap<u64, Vec<u8>>, index: u64) -> Result<(), WalError> {
    match entries.keys().next_back() {
        Some(&last) if index != last + 1 => Err(WalError::Corrupted(format!(
            "write at {} after last index {}",
            index, last
        ))),
        None if index == 0 => Err(WalError::Corrupted("index 0 is reserved".to_string())),
        _ => Ok(()),
    }
}

impl WriteAheadLog for FileWal {
    fn write(&self, index: u64, data: &[u8]) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        check_next(&inner.entries, index)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
        encode_frame(index, data, &mut frame)?;
        inner.file.write_all(&frame)?;
        inner.file.sync_data()?;
        inner.entries.insert(index, data.to_vec());
        Ok(())
    }

    fn read(&self, index: u64) -> Result<Vec<u8>, WalError> {
        self.inner
            .lock()
            .entries
            .get(&index)
            .cloned()
            .ok_or(WalError::NotFound(index))
    }

    fn first_index(&self) -> Result<u64, WalError> {
        Ok(self.inner.lock().entries.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64, WalError> {
        Ok(self
            .inner
            .lock()
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    /// The newest entry always survives so the index sequence continues.
    fn truncate_front(&self, index: u64) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        let Some(&last) = inner.entries.keys().next_back() else {
            return Ok(());
        };
        let keep_from = index.min(last);
        let kept = inner.entries.split_off(&keep_from);

        let mut buf = Vec::new();
        for (idx, data) in &kept {
            encode_frame(*idx, data, &mut buf)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&buf)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        inner.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        inner.entries = kept;
        Ok(())
    }
}

/// Volatile WAL for tests and throwaway nodes
#[derive(Default)]
pub struct InMemoryWal {
    entries: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl InMemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl WriteAheadLog for InMemoryWal {
    fn write(&self, index: u64, data: &[u8]) -> Result<(), WalError> {
        let mut entries = self.entries.lock();
        check_next(&entries, index)?;
        entries.insert(index, data.to_vec());
        Ok(())
    }

    fn read(&self, index: u64) -> Result<Vec<u8>, WalError> {
        self.entries
            .lock()
            .get(&index)
            .cloned()
            .ok_or(WalError::NotFound(index))
    }

    fn first_index(&self) -> Result<u64, WalError> {
        Ok(self.entries.lock().keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64, WalError> {
        Ok(self.entries.lock().keys().next_back().copied().unwrap_or(0))
    }

    fn truncate_front(&self, index: u64) -> Result<(), WalError> {
        let mut entries = self.entries.lock();
        let Some(&last) = entries.keys().next_back() else {
            return Ok(());
        };
        *entries = entries.split_off(&index.min(last));
        Ok(())
    }
}
