//! In-memory [`CacheStore`] with call counters, for resolver tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;

use super::{CacheStore, ObjectMeta, ObjectStream, PutOutcome};

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, (Bytes, Option<String>)>>,
    pub heads: AtomicUsize,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    /// When set, every call fails as if the store were unreachable.
    pub broken: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, path: &str, body: impl Into<Bytes>, content_type: Option<&str>) {
        self.objects.lock().unwrap().insert(
            path.to_string(),
            (body.into(), content_type.map(str::to_string)),
        );
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(path).map(|(b, _)| b.clone())
    }

    pub fn calls(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
            + self.gets.load(Ordering::SeqCst)
            + self.puts.load(Ordering::SeqCst)
    }

    fn fail_if_broken(&self) -> Result<()> {
        if self.broken {
            anyhow::bail!("store unreachable");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.fail_if_broken()?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|(body, content_type)| ObjectMeta {
                length: body.len() as u64,
                content_type: content_type.clone(),
            }))
    }

    async fn get_object_stream(&self, path: &str) -> Result<Option<ObjectStream>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.fail_if_broken()?;
        let body = self.get(path);
        Ok(body.map(|b| futures::stream::iter([Ok(b)]).boxed()))
    }

    async fn put_object(
        &self,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<PutOutcome> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.fail_if_broken()?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(path) {
            return Ok(PutOutcome::AlreadyExists);
        }
        objects.insert(path.to_string(), (body, content_type.map(str::to_string)));
        Ok(PutOutcome::Written)
    }

    async fn check(&self) -> Result<()> {
        self.fail_if_broken()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
