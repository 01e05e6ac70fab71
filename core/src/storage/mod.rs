pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CoreError, Result};

/// CAS が競合し続けたときに諦めるまでの試行回数
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// キー/値ストア抽象trait
///
/// キュー・送信ログ・処理リースの永続化先。値は JSON。
/// 複数プロセスから同じストアを触る前提なので、更新は compare_and_swap で行う。
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 値取得（未設定なら None）
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// 値設定
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// 値削除
    async fn delete(&self, key: &str) -> Result<()>;

    /// 現在値が `expected` と一致するときだけ `new` に置き換える
    ///
    /// `None` は「未設定」を表す。`new` が `None` なら削除。
    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: Option<Value>) -> Result<bool>;
}

/// 読み取り→変換→CAS を成功するまで繰り返す
///
/// `f` は現在値を受け取り、書き込む値と呼び出し元への戻り値を返す。
/// 競合時は最新値で `f` が呼び直されるので副作用を持たせないこと。
pub async fn update<F, T>(store: &dyn KeyValueStore, key: &str, mut f: F) -> Result<T>
where
    F: FnMut(Option<&Value>) -> Result<(Option<Value>, T)> + Send,
    T: Send,
{
    for attempt in 0..MAX_UPDATE_ATTEMPTS {
        let current = store.get(key).await?;
        let (next, out) = f(current.as_ref())?;
        if next == current {
            return Ok(out);
        }
        if store.compare_and_swap(key, current.as_ref(), next).await? {
            return Ok(out);
        }
        log::debug!("CAS conflict on {} (attempt {})", key, attempt + 1);
    }
    Err(CoreError::StorageError(format!(
        "gave up updating {} after {} conflicting writes",
        key, MAX_UPDATE_ATTEMPTS
    )))
}
