//! In-memory [`ContentStore`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{source_for_path, ContentEntry, ContentMeta, ContentStore};
use crate::chunk::hash_text;

#[derive(Default)]
pub struct InMemoryContentStore {
    files: RwLock<BTreeMap<String, (String, i64)>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write with an explicit timestamp, for retention tests.
    pub fn write_at(&self, path: &str, content: &str, updated_at: i64) -> Result<ContentMeta> {
        let mut files = self
            .files
            .write()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        files.insert(path.to_string(), (content.to_string(), updated_at));
        Ok(meta_for(path, content, updated_at))
    }
}

fn meta_for(path: &str, content: &str, updated_at: i64) -> ContentMeta {
    ContentMeta {
        path: path.to_string(),
        source: source_for_path(path),
        hash: hash_text(content),
        updated_at,
        size: content.len() as u64,
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn write(&self, path: &str, content: &str) -> Result<ContentMeta> {
        self.write_at(path, content, now())
    }

    async fn append(&self, path: &str, content: &str) -> Result<ContentMeta> {
        let mut files = self
            .files
            .write()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        let ts = now();
        let entry = files
            .entry(path.to_string())
            .or_insert_with(|| (String::new(), ts));
        entry.0.push_str(content);
        entry.1 = ts;
        Ok(meta_for(path, &entry.0, ts))
    }

    async fn read(&self, path: &str) -> Result<Option<ContentEntry>> {
        let files = self
            .files
            .read()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        Ok(files.get(path).map(|(content, ts)| ContentEntry {
            meta: meta_for(path, content, *ts),
            content: content.clone(),
        }))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut files = self
            .files
            .write()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        Ok(files.remove(path).is_some())
    }

    async fn list(&self) -> Result<Vec<ContentMeta>> {
        let files = self
            .files
            .read()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        Ok(files
            .iter()
            .map(|(path, (content, ts))| meta_for(path, content, *ts))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;

    #[tokio::test]
    async fn test_write_append_read() {
        let store = InMemoryContentStore::new();
        store.write("memory/a.md", "one").await.unwrap();
        store.append("memory/a.md", "\ntwo").await.unwrap();
        let entry = store.read("memory/a.md").await.unwrap().unwrap();
        assert_eq!(entry.content, "one\ntwo");
        assert_eq!(entry.meta.hash, hash_text("one\ntwo"));
        assert_eq!(entry.meta.source, Source::Memory);
    }

    #[tokio::test]
    async fn test_list_is_ordered_with_timestamps() {
        let store = InMemoryContentStore::new();
        store.write_at("memory/a.md", "a", 10).unwrap();
        store.write_at("sessions/s.md", "s", 20).unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].source, Source::Sessions);
        assert_eq!(all[0].updated_at, 10);
        assert_eq!(all[1].updated_at, 20);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryContentStore::new();
        store.write("memory/a.md", "a").await.unwrap();
        assert!(store.delete("memory/a.md").await.unwrap());
        assert!(!store.delete("memory/a.md").await.unwrap());
        assert!(store.read("memory/a.md").await.unwrap().is_none());
    }
}
