use std::fs::File;
use std::path::Path;

use common::error::AppError;
use memmap2::Mmap;

use crate::hash::{cdb_hash, probe_start, table_index};
use crate::{HEADER_SIZE, NUM_TABLES};

#[derive(Clone, Copy)]
struct SlotHeader {
    table_offset: u64,
    table_len: u64,
}

/// A memory-mapped CDB64 file. `get` is first-match-wins; `entries` yields
/// every record (including duplicates) in physical insertion order (spec §4.A).
pub struct Reader {
    mmap: Mmap,
    header: [SlotHeader; NUM_TABLES],
    records_end: u64,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        // SAFETY: the file is not expected to be mutated concurrently while
        // mapped; this mirrors the read-only mmap idiom used for immutable
        // on-disk hash-table formats elsewhere in the ecosystem.
        let mmap = unsafe { Mmap::map(&file)? };

        if (mmap.len() as u64) < HEADER_SIZE {
            return Err(AppError::Corrupt(format!(
                "cdb64 file {} shorter than header",
                path.display()
            )));
        }

        let mut header = [SlotHeader {
            table_offset: 0,
            table_len: 0,
        }; NUM_TABLES];
        let mut records_end = file_len;

        for (i, slot) in header.iter_mut().enumerate() {
            let base = i * 16;
            let table_offset = read_u64(&mmap, base as u64)?;
            let table_len = read_u64(&mmap, base as u64 + 8)?;

            if table_len == 0 {
                // An empty hash bucket: the ordinary CDB convention once a
                // file holds fewer than ~2*NUM_TABLES keys. Nothing to probe
                // and no table bytes were written for this slot, so there's
                // no offset to range-check either.
                *slot = SlotHeader {
                    table_offset,
                    table_len: 0,
                };
                continue;
            }
            let table_bytes = table_len
                .checked_mul(16)
                .ok_or_else(|| AppError::Corrupt("table length overflow".to_string()))?;
            let table_end = table_offset
                .checked_add(table_bytes)
                .ok_or_else(|| AppError::Corrupt("table offset overflow".to_string()))?;
            if table_end > file_len {
                return Err(AppError::Corrupt(format!(
                    "cdb64 file {} has out-of-bounds table at slot {i}",
                    path.display()
                )));
            }

            records_end = records_end.min(table_offset);
            *slot = SlotHeader {
                table_offset,
                table_len,
            };
        }

        Ok(Self {
            mmap,
            header,
            records_end,
        })
    }

    /// First-match-wins lookup (spec §4.A, §8).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AppError> {
        let h = cdb_hash(key);
        let slot = &self.header[table_index(h)];
        let table_len = slot.table_len as usize;
        if table_len == 0 {
            return Ok(None);
        }

        let mut probe = probe_start(h, table_len);
        for _ in 0..table_len {
            let slot_offset = slot.table_offset + (probe as u64) * 16;
            let slot_hash = read_u64(&self.mmap, slot_offset)?;
            let record_offset = read_u64(&self.mmap, slot_offset + 8)?;

            if record_offset == 0 {
                return Ok(None);
            }
            if slot_hash == h {
                let (rec_key, rec_value) = self.read_record(record_offset)?;
                if rec_key == key {
                    return Ok(Some(rec_value));
                }
            }
            probe = (probe + 1) % table_len;
        }
        Ok(None)
    }

    /// Iterate every record in physical (insertion) order, duplicates included.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            reader: self,
            pos: HEADER_SIZE,
        }
    }

    pub fn close(self) {
        // Dropping releases the mmap and file handle.
    }

    fn read_record(&self, offset: u64) -> Result<(Vec<u8>, Vec<u8>), AppError> {
        let key_len = read_u64(&self.mmap, offset)?;
        let value_len = read_u64(&self.mmap, offset + 8)?;
        let key_start = offset + 16;
        let key_end = key_start
            .checked_add(key_len)
            .ok_or_else(|| AppError::Corrupt("key length overflow".to_string()))?;
        let value_end = key_end
            .checked_add(value_len)
            .ok_or_else(|| AppError::Corrupt("value length overflow".to_string()))?;
        if value_end > self.mmap.len() as u64 {
            return Err(AppError::Corrupt("record extends past file end".to_string()));
        }

        let key = self.mmap[key_start as usize..key_end as usize].to_vec();
        let value = self.mmap[key_end as usize..value_end as usize].to_vec();
        Ok((key, value))
    }
}

fn read_u64(mmap: &Mmap, offset: u64) -> Result<u64, AppError> {
    let start = offset as usize;
    let end = start
        .checked_add(8)
        .ok_or_else(|| AppError::Corrupt("offset overflow".to_string()))?;
    let bytes = mmap
        .get(start..end)
        .ok_or_else(|| AppError::Corrupt("read past end of file".to_string()))?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("slice is 8 bytes")))
}

/// Ordered iterator over every `(key, value)` record, duplicates included.
pub struct Entries<'a> {
    reader: &'a Reader,
    pos: u64,
}

impl Iterator for Entries<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.reader.records_end {
            return None;
        }

        let key_len = match read_u64(&self.reader.mmap, self.pos) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let value_len = match read_u64(&self.reader.mmap, self.pos + 8) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let key_start = self.pos + 16;
        let key_end = key_start + key_len;
        let value_end = key_end + value_len;

        if value_end > self.reader.mmap.len() as u64 {
            return Some(Err(AppError::Corrupt(
                "record extends past file end".to_string(),
            )));
        }

        let key = self.reader.mmap[key_start as usize..key_end as usize].to_vec();
        let value = self.reader.mmap[key_end as usize..value_end as usize].to_vec();
        self.pos = value_end;
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Writer;

    #[test]
    fn duplicate_keys_first_match_wins_but_iteration_yields_all() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dup.cdb");

        let mut writer = Writer::create(&path).expect("create writer");
        writer.add(b"k", b"v1").expect("add");
        writer.add(b"k", b"v2").expect("add");
        writer.add(b"k", b"v3").expect("add");
        writer.finalize().expect("finalize");

        let reader = Reader::open(&path).expect("open");
        assert_eq!(reader.get(b"k").expect("get"), Some(b"v1".to_vec()));

        let values: Vec<Vec<u8>> = reader
            .entries()
            .map(|r| r.expect("entry").1)
            .collect();
        assert_eq!(values.len(), 3);
        assert!(values.contains(&b"v1".to_vec()));
        assert!(values.contains(&b"v2".to_vec()));
        assert!(values.contains(&b"v3".to_vec()));
    }

    #[test]
    fn open_nonexistent_file_is_an_error_not_a_panic() {
        let result = Reader::open("/nonexistent/path/does-not-exist.cdb");
        assert!(result.is_err());
        assert!(result.err().expect("error").is_not_found());
    }

    #[test]
    fn large_value_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("large.cdb");
        let big_value = vec![0x42u8; 1024 * 1024];

        let mut writer = Writer::create(&path).expect("create writer");
        writer.add(b"big", &big_value).expect("add");
        writer.finalize().expect("finalize");

        let reader = Reader::open(&path).expect("open");
        assert_eq!(reader.get(b"big").expect("get"), Some(big_value));
    }

    #[test]
    fn empty_database_returns_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.cdb");
        let writer = Writer::create(&path).expect("create writer");
        writer.finalize().expect("finalize");

        let reader = Reader::open(&path).expect("open");
        assert_eq!(reader.get(b"anything").expect("get"), None);
        assert_eq!(reader.entries().count(), 0);
    }

    /// `Writer` always forces `table_len = max(1, 2*n)` and so never emits a
    /// genuine zero-length table; a file written by another implementation
    /// following the plain CDB convention can, for any bucket with no keys.
    /// Hand-build one to make sure `open`/`get` treat that as an empty
    /// bucket rather than corruption.
    #[test]
    fn a_genuinely_zero_length_table_is_an_empty_bucket_not_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sparse.cdb");

        let key: &[u8] = b"only-key";
        let value: &[u8] = b"only-value";
        let h = cdb_hash(key);
        let occupied = table_index(h);

        let record_offset = HEADER_SIZE;
        let record_len = 16 + key.len() as u64 + value.len() as u64;
        let table_len: u64 = 2;
        let probe = probe_start(h, table_len as usize) as u64;
        let table_offset = record_offset + record_len;

        let mut file = vec![0u8; HEADER_SIZE as usize];
        for i in 0..NUM_TABLES {
            let base = i * 16;
            if i == occupied {
                file[base..base + 8].copy_from_slice(&table_offset.to_le_bytes());
                file[base + 8..base + 16].copy_from_slice(&table_len.to_le_bytes());
            }
            // every other slot is left as {0, 0}: a genuine zero-length table.
        }

        file.extend_from_slice(&(key.len() as u64).to_le_bytes());
        file.extend_from_slice(&(value.len() as u64).to_le_bytes());
        file.extend_from_slice(key);
        file.extend_from_slice(value);

        let mut table = vec![0u8; (table_len as usize) * 16];
        let slot_base = (probe as usize) * 16;
        table[slot_base..slot_base + 8].copy_from_slice(&h.to_le_bytes());
        table[slot_base + 8..slot_base + 16].copy_from_slice(&record_offset.to_le_bytes());
        file.extend_from_slice(&table);

        std::fs::write(&path, &file).expect("write raw cdb64 file");

        let reader = Reader::open(&path).expect("open a file with mostly zero-length tables");
        assert_eq!(reader.get(key).expect("get"), Some(value.to_vec()));

        let absent = (0u32..)
            .map(|i| i.to_le_bytes().to_vec())
            .find(|candidate| table_index(cdb_hash(candidate)) != occupied)
            .expect("some candidate lands outside the one occupied bucket");
        assert_eq!(reader.get(&absent).expect("get"), None);
        assert_eq!(reader.entries().count(), 1);
    }
}
