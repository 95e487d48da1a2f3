//! One history file on disk: a magic/version header framing the core
//! history stream, written atomically via a sibling temp file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rewind_core::{HistoryError, HistorySettings, StateHistory};

/// File identification magic ("REWINDH" plus a format nibble).
const HISTORY_MAGIC: u64 = 0x0052_4557_494E_4448;
/// Current file format version.
const HISTORY_VERSION: u32 = 1;

/// Errors raised by the durable-file layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An underlying filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The file is not a history file, or is damaged.
    #[error("corrupt history file: {0}")]
    Corrupt(String),

    /// The framed history stream failed to reconstruct.
    #[error("history error: {0}")]
    History(#[from] HistoryError),
}

/// Save and load one framed history file.
pub struct HistoryFile;

impl HistoryFile {
    /// Write `history` to `path`, replacing any previous file atomically:
    /// the bytes land in a sibling temp file first and are renamed into
    /// place only after a successful sync.
    ///
    /// # Errors
    ///
    /// Any filesystem error; the destination is left untouched on failure.
    pub fn save(path: &Path, history: &StateHistory) -> Result<(), StorageError> {
        let tmp = tmp_path(path);
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&HISTORY_MAGIC.to_le_bytes())?;
            writer.write_all(&HISTORY_VERSION.to_le_bytes())?;
            history.save_state(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "saved history file");
        Ok(())
    }

    /// Load a history file written by [`save`](Self::save).
    ///
    /// `settings` and `is_stale` are forwarded to
    /// [`StateHistory::create`]; see there for the reconstruction rules.
    ///
    /// # Errors
    ///
    /// [`StorageError::Corrupt`] on a bad header;
    /// [`StorageError::History`] when the framed stream fails to
    /// reconstruct.
    pub fn load<F>(
        path: &Path,
        settings: HistorySettings,
        is_stale: F,
    ) -> Result<StateHistory, StorageError>
    where
        F: FnMut(u64) -> bool,
    {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(truncated)?;
        if u64::from_le_bytes(magic) != HISTORY_MAGIC {
            return Err(StorageError::Corrupt("bad magic number".into()));
        }
        let mut version = [0u8; 4];
        reader.read_exact(&mut version).map_err(truncated)?;
        let version = u32::from_le_bytes(version);
        if version != HISTORY_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }

        Ok(StateHistory::create(&mut reader, settings, is_stale)?)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn truncated(err: io::Error) -> StorageError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        StorageError::Corrupt("unexpected end of file".into())
    } else {
        StorageError::Io(err)
    }
}
