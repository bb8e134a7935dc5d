//! `FileRegistry`: the on-disk name→fileId map (spec.md §4.2, §6).
//!
//! Append-structured: every mutation is appended as a record and
//! `fsync`'d, and the file is only ever rewritten wholesale on `close()`.
//! The materialized `name -> fileId` view is rebuilt by replaying every
//! record in file order, last value wins.

use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const NAME_MAP_FILE: &str = "name_id_map.cm";

struct Record {
    name: String,
    file_id: i64,
}

fn read_record(r: &mut impl Read) -> std::io::Result<Option<Record>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let name_size = i32::from_ne_bytes(len_buf) as usize;
    let mut name_bytes = vec![0u8; name_size];
    r.read_exact(&mut name_bytes)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut id_buf = [0u8; 8];
    r.read_exact(&mut id_buf)?;
    let file_id = i64::from_ne_bytes(id_buf);
    Ok(Some(Record { name, file_id }))
}

fn encode_record(name: &str, file_id: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len() + 8);
    out.extend_from_slice(&(name.len() as i32).to_ne_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&file_id.to_ne_bytes());
    out
}

struct Holder {
    path: PathBuf,
    file: File,
}

/// The on-disk name→fileId log, plus the materialized map it replays into.
/// Positive ids are active files, negative ids are tombstones that reserve
/// the id for a later `add` of the same name, zero is never assigned.
pub struct FileRegistry {
    holder: RwLock<Holder>,
    names: RwLock<HashMap<String, i32>>,
    file_counter: RwLock<i32>,
}

impl FileRegistry {
    /// Read every record in `dir/name_id_map.cm` (creating it if absent)
    /// and replay them in order, last value wins, to build the in-memory
    /// map. `file_counter` is set to the largest `|fileId|` seen.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(NAME_MAP_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut names: HashMap<String, i32> = HashMap::new();
        let mut counter: i32 = 0;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&file);
        while let Some(record) = read_record(&mut reader)? {
            let id = record.file_id as i32;
            names.insert(record.name, id);
            counter = counter.max(id.unsigned_abs() as i32);
        }
        drop(reader);
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            holder: RwLock::new(Holder { path, file }),
            names: RwLock::new(names),
            file_counter: RwLock::new(counter),
        })
    }

    fn append(&self, name: &str, file_id: i64) -> Result<()> {
        let mut holder = self.holder.write();
        let record = encode_record(name, file_id);
        holder.file.write_all(&record)?;
        holder.file.sync_all()?;
        Ok(())
    }

    /// Assign or revive a file id for `name`. Fails if `name` is already
    /// present with a positive (active) id.
    pub fn add(&self, name: &str) -> Result<i32> {
        let assigned = {
            let mut names = self.names.write();
            match names.get(name).copied() {
                Some(id) if id > 0 => {
                    return Err(CacheError::AlreadyExists(name.to_string()));
                }
                Some(negative_id) => {
                    let revived = -negative_id;
                    names.insert(name.to_string(), revived);
                    revived
                }
                None => {
                    let mut counter = self.file_counter.write();
                    *counter += 1;
                    let assigned = *counter;
                    names.insert(name.to_string(), assigned);
                    assigned
                }
            }
        };
        self.append(name, assigned as i64)?;
        Ok(assigned)
    }

    /// Look up the live file id for `name`, if any (tombstoned entries are
    /// not visible here).
    pub fn lookup(&self, name: &str) -> Option<i32> {
        self.names.read().get(name).copied().filter(|id| *id > 0)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let id = self
            .names
            .read()
            .get(old)
            .copied()
            .filter(|id| *id > 0)
            .ok_or_else(|| CacheError::UnknownFile(old.to_string()))?;

        {
            let mut names = self.names.write();
            names.insert(old.to_string(), -id);
            names.insert(new.to_string(), id);
        }
        self.append(old, -(id as i64))?;
        self.append(new, id as i64)?;
        Ok(())
    }

    /// Tombstone `name`, keeping its id reserved for a future revive.
    pub fn delete(&self, name: &str) -> Result<()> {
        let id = self
            .names
            .read()
            .get(name)
            .copied()
            .filter(|id| *id > 0)
            .ok_or_else(|| CacheError::UnknownFile(name.to_string()))?;

        self.names.write().insert(name.to_string(), -id);
        self.append(name, -(id as i64))
    }

    /// Truncate the holder and rewrite exactly one record per live entry.
    pub fn close(&self) -> Result<()> {
        let names = self.names.read();
        let mut holder = self.holder.write();
        holder.file.set_len(0)?;
        holder.file.seek(SeekFrom::Start(0))?;
        for (name, id) in names.iter() {
            holder.file.write_all(&encode_record(name, *id as i64))?;
        }
        holder.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.holder.read().path.clone()
    }

    /// Snapshot of every currently-active `(name, fileId)` pair.
    pub fn active_entries(&self) -> Vec<(String, i32)> {
        self.names
            .read()
            .iter()
            .filter(|(_, id)| **id > 0)
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_assigns_increasing_ids_and_skips_zero() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        let a = registry.add("a.dat").unwrap();
        let b = registry.add("b.dat").unwrap();
        assert!(a > 0 && b > 0);
        assert_ne!(a, b);
    }

    #[test]
    fn add_existing_active_name_fails() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        registry.add("a.dat").unwrap();
        assert!(registry.add("a.dat").is_err());
    }

    #[test]
    fn delete_then_add_revives_same_id() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        let id = registry.add("a.dat").unwrap();
        registry.delete("a.dat").unwrap();
        assert!(registry.lookup("a.dat").is_none());
        let revived = registry.add("a.dat").unwrap();
        assert_eq!(revived, id);
    }

    #[test]
    fn rename_moves_the_live_id() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        let id = registry.add("old.dat").unwrap();
        registry.rename("old.dat", "new.dat").unwrap();
        assert!(registry.lookup("old.dat").is_none());
        assert_eq!(registry.lookup("new.dat"), Some(id));
    }

    #[test]
    fn reload_replays_records_in_order() {
        let dir = tempdir().unwrap();
        {
            let registry = FileRegistry::load_or_create(dir.path()).unwrap();
            registry.add("a.dat").unwrap();
            registry.add("b.dat").unwrap();
            registry.delete("a.dat").unwrap();
        }
        let reloaded = FileRegistry::load_or_create(dir.path()).unwrap();
        assert!(reloaded.lookup("a.dat").is_none());
        assert!(reloaded.lookup("b.dat").is_some());
    }

    #[test]
    fn close_compacts_to_one_record_per_live_entry() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        registry.add("a.dat").unwrap();
        registry.add("b.dat").unwrap();
        registry.delete("b.dat").unwrap();
        registry.close().unwrap();

        let reloaded = FileRegistry::load_or_create(dir.path()).unwrap();
        assert!(reloaded.lookup("a.dat").is_some());
        assert!(reloaded.lookup("b.dat").is_none());
    }
}
