use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use common::error::AppError;
use tempfile::NamedTempFile;

use crate::hash::{cdb_hash, probe_start, table_index};
use crate::{HEADER_SIZE, NUM_TABLES};

/// Streams `(key, value)` records to a temp file in the target directory and
/// builds the 256 open-addressed hash tables on `finalize`. Nothing is
/// observable under the final name until `finalize` succeeds: a crash before
/// that point leaves only the (ignored) temp file (spec §4.A).
pub struct Writer {
    final_path: PathBuf,
    tmp: NamedTempFile,
    offset: u64,
    slot_lists: Vec<Vec<(u64, u64)>>,
}

impl Writer {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let final_path = path.as_ref().to_path_buf();
        let dir = final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&vec![0u8; HEADER_SIZE as usize])?;

        Ok(Self {
            final_path,
            tmp,
            offset: HEADER_SIZE,
            slot_lists: vec![Vec::new(); NUM_TABLES],
        })
    }

    /// Append a record. Keys may be empty or contain NUL bytes; duplicate
    /// keys are permitted (spec §3).
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), AppError> {
        let record_offset = self.offset;
        self.tmp.write_all(&(key.len() as u64).to_le_bytes())?;
        self.tmp.write_all(&(value.len() as u64).to_le_bytes())?;
        self.tmp.write_all(key)?;
        self.tmp.write_all(value)?;
        self.offset += 16 + key.len() as u64 + value.len() as u64;

        let h = cdb_hash(key);
        self.slot_lists[table_index(h)].push((h, record_offset));
        Ok(())
    }

    /// Build the hash tables, patch the header, and atomically move the
    /// finished file into place.
    pub fn finalize(mut self) -> Result<(), AppError> {
        self.write_tables_and_header()?;
        self.tmp
            .persist(&self.final_path)
            .map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }

    /// Thin wrapper over `finalize` for callers that want the finished
    /// bytes handed to an arbitrary sink (e.g. an upload stream) instead of
    /// a file under `final_path`.
    pub fn finalize_into(mut self, mut writer: impl Write) -> Result<(), AppError> {
        self.write_tables_and_header()?;
        self.tmp.as_file_mut().seek(SeekFrom::Start(0))?;
        std::io::copy(self.tmp.as_file_mut(), &mut writer)?;
        Ok(())
    }

    /// Builds the 256 hash tables from the buffered slot lists, appends them
    /// to the temp file, and patches the header in place. Leaves the temp
    /// file's cursor at EOF; callers seek back to 0 if they need to read it.
    fn write_tables_and_header(&mut self) -> Result<(), AppError> {
        let mut header = vec![0u8; HEADER_SIZE as usize];

        for (slot_index, list) in self.slot_lists.iter().enumerate() {
            let table_len = std::cmp::max(1, list.len() * 2);
            let mut table = vec![(0u64, 0u64); table_len];

            for &(h, record_offset) in list {
                let mut probe = probe_start(h, table_len);
                loop {
                    if table[probe].1 == 0 {
                        table[probe] = (h, record_offset);
                        break;
                    }
                    probe = (probe + 1) % table_len;
                }
            }

            let table_offset = self.offset;
            for (h, record_offset) in &table {
                self.tmp.write_all(&h.to_le_bytes())?;
                self.tmp.write_all(&record_offset.to_le_bytes())?;
            }
            self.offset += (table_len as u64) * 16;

            let base = slot_index * 16;
            header[base..base + 8].copy_from_slice(&table_offset.to_le_bytes());
            header[base + 8..base + 16].copy_from_slice(&(table_len as u64).to_le_bytes());
        }

        self.tmp.flush()?;
        self.tmp.as_file_mut().seek(SeekFrom::Start(0))?;
        self.tmp.as_file_mut().write_all(&header)?;
        self.tmp.as_file_mut().flush()?;
        self.tmp.as_file_mut().sync_all()?;
        Ok(())
    }
}
