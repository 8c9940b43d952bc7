//! In-memory view of the file index and content-hash index.
//!
//! The state is loaded once from the metadata store and changed only through
//! [`FileIndexState::commit`], which writes an [`IndexUpdate`] in one
//! transaction and applies it in memory after the commit succeeds.

use crate::metadata::file_index::{self, ContentHashEntry, FileIndexEntry};
use crate::metadata::{records, BackupRecord, MetadataStore};
use crate::utils::errors::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct FileIndexState {
    entries: HashMap<PathBuf, FileIndexEntry>,
    contents: HashMap<String, ContentHashEntry>,
}

/// One logical change to the indices.
#[derive(Debug, Default)]
pub struct IndexUpdate {
    pub insert_records: Vec<BackupRecord>,
    pub delete_records: Vec<String>,
    pub upsert_entries: Vec<FileIndexEntry>,
    /// Drop every index entry backed by these record ids
    pub release_entries_of: Vec<String>,
    pub upsert_contents: Vec<ContentHashEntry>,
    pub delete_contents: Vec<String>,
}

impl FileIndexState {
    pub fn load(store: &MetadataStore) -> Result<Self> {
        let (entries, contents) = store.with_conn(|conn| {
            Ok((file_index::load_entries(conn)?, file_index::load_contents(conn)?))
        })?;
        Ok(Self {
            entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
            contents: contents
                .into_iter()
                .map(|c| (c.content_hash.clone(), c))
                .collect(),
        })
    }

    pub fn entry(&self, path: &Path) -> Option<&FileIndexEntry> {
        self.entries.get(path)
    }

    pub fn content(&self, content_hash: &str) -> Option<&ContentHashEntry> {
        self.contents.get(content_hash)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileIndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn content_count(&self) -> usize {
        self.contents.len()
    }

    pub fn commit(&mut self, store: &MetadataStore, update: IndexUpdate) -> Result<()> {
        store.transaction(|tx| {
            for record in &update.insert_records {
                records::insert(tx, record)?;
            }
            for id in &update.release_entries_of {
                file_index::delete_entries_for_record(tx, id)?;
            }
            for entry in &update.upsert_entries {
                file_index::upsert_entry(tx, entry)?;
            }
            for content in &update.upsert_contents {
                file_index::upsert_content(tx, content)?;
            }
            for hash in &update.delete_contents {
                file_index::delete_content(tx, hash)?;
            }
            for id in &update.delete_records {
                records::delete(tx, id)?;
            }
            Ok(())
        })?;

        let released: HashSet<&String> = update.release_entries_of.iter().collect();
        if !released.is_empty() {
            self.entries.retain(|_, e| !released.contains(&e.record_id));
        }
        for entry in update.upsert_entries {
            self.entries.insert(entry.path.clone(), entry);
        }
        for content in update.upsert_contents {
            self.contents.insert(content.content_hash.clone(), content);
        }
        for hash in &update.delete_contents {
            self.contents.remove(hash);
        }
        Ok(())
    }
}
