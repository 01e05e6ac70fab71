//! JSON ファイルに保存する KeyValueStore

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::storage::KeyValueStore;

/// 1つの JSON オブジェクトファイルに全キーを保存する
///
/// 読み書きはすべて `<path>.lock` の排他ファイルロックを取ってから行うので、
/// 同じファイルを開いた別プロセス・別インスタンスとも直列化される。
/// 書き込みは同じディレクトリの一時ファイルに書いてから rename する。
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type Transaction<T> = Box<dyn FnOnce(&mut Map<String, Value>) -> Result<(T, bool)> + Send>;

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        lock_path(&self.path)
    }

    /// ファイルロックを取って読み込み、`f` が true を返したら保存する
    async fn transact<T: Send + 'static>(&self, f: Transaction<T>) -> Result<T> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(lock_path(&path))?;
            let mut lock = fd_lock::RwLock::new(file);
            let _held = lock.write()?;

            let mut map = load(&path)?;
            let (out, dirty) = f(&mut map)?;
            if dirty {
                save(&path, map)?;
            }
            Ok(out)
        })
        .await
        .map_err(|e| CoreError::StorageError(format!("file store task failed: {}", e)))?
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut lock = path.to_path_buf().into_os_string();
    lock.push(".lock");
    PathBuf::from(lock)
}

fn load(path: &Path) -> Result<Map<String, Value>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CoreError::StorageError(format!(
            "{} does not contain a JSON object",
            path.display()
        ))),
        Err(e) => Err(CoreError::StorageError(format!("{}: {}", path.display(), e))),
    }
}

fn save(path: &Path, map: Map<String, Value>) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let data = serde_json::to_vec_pretty(&Value::Object(map))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CoreError::from(e.error))?;
    Ok(())
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.transact(Box::new(move |map| Ok((map.remove(&key), false)))).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.transact(Box::new(move |map| {
            map.insert(key, value);
            Ok(((), true))
        }))
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.transact(Box::new(move |map| Ok(((), map.remove(&key).is_some())))).await
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: Option<Value>) -> Result<bool> {
        let key = key.to_string();
        let expected = expected.cloned();
        self.transact(Box::new(move |map| {
            if map.get(&key) != expected.as_ref() {
                return Ok((false, false));
            }
            match new {
                Some(value) => map.insert(key, value),
                None => map.remove(&key),
            };
            Ok((true, true))
        }))
        .await
    }
}
