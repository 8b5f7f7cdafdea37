//! ObjectCache - 共有リソースの非同期解決キャッシュ
//!
//! フォントや画像のように worker から後で届くものを id で引く。
//!
//! # 規則
//! - 1 つの id は 1 回だけ resolve される。2 回目は何もしない（警告だけ）
//! - `get` は同期版。未解決なら `NotResolved`
//! - `get_async` は resolve されるまで待つ。待ち始めたあとで resolve されても届く
//! - `clear` は全エントリを捨て、値が持つ外部リソースを解放する。待っている側は `CacheCleared`
//!
//! エントリごとに `tokio::sync::watch` を 1 本持ち、待ち手はそれを購読する。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::lock;
use crate::error::BobbinError;

/// clear 時に外部リソースを解放できる値
///
/// デフォルトは何もしない。
pub trait Releasable: Send + Sync + 'static {
    fn release(&self) {}
}

impl Releasable for serde_json::Value {}
impl Releasable for String {}

#[derive(Debug)]
enum Slot<V> {
    Pending,
    Resolved(Arc<V>),
    Cleared,
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        match self {
            Slot::Pending => Slot::Pending,
            Slot::Resolved(value) => Slot::Resolved(Arc::clone(value)),
            Slot::Cleared => Slot::Cleared,
        }
    }
}

pub struct ObjectCache<V: Releasable> {
    name: String,
    entries: Mutex<HashMap<String, watch::Sender<Slot<V>>>>,
}

impl<V: Releasable> ObjectCache<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 同期版。まだ resolve されていなければ `NotResolved`。
    pub fn get(&self, id: &str) -> Result<Arc<V>, BobbinError> {
        let entries = lock(&self.entries);
        match entries.get(id).map(|tx| (*tx.borrow()).clone()) {
            Some(Slot::Resolved(value)) => Ok(value),
            _ => Err(BobbinError::NotResolved(id.to_string())),
        }
    }

    /// resolve されるまで待つ
    pub async fn get_async(&self, id: &str) -> Result<Arc<V>, BobbinError> {
        let mut rx = {
            let mut entries = lock(&self.entries);
            entries
                .entry(id.to_string())
                .or_insert_with(|| watch::channel(Slot::Pending).0)
                .subscribe()
        };
        let slot = match rx.wait_for(|slot| !matches!(slot, Slot::Pending)).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => Slot::Cleared,
        };
        match slot {
            Slot::Resolved(value) => Ok(value),
            Slot::Pending | Slot::Cleared => Err(BobbinError::CacheCleared(id.to_string())),
        }
    }

    pub fn has(&self, id: &str) -> bool {
        lock(&self.entries)
            .get(id)
            .is_some_and(|tx| matches!(*tx.borrow(), Slot::Resolved(_)))
    }

    /// 値を確定させる。すでに確定していたら何もせず `false`。
    pub fn resolve(&self, id: &str, value: V) -> bool {
        let mut entries = lock(&self.entries);
        let tx = entries
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(Slot::Pending).0);
        if matches!(*tx.borrow(), Slot::Resolved(_)) {
            warn!(cache = %self.name, id, "object resolved twice; keeping the first value");
            return false;
        }
        tx.send_replace(Slot::Resolved(Arc::new(value)));
        true
    }

    /// 全エントリを捨てる。解放した値の数を返す。
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.entries).drain().collect();
        let mut released = 0;
        for (_, tx) in drained {
            let previous = tx.send_replace(Slot::Cleared);
            if let Slot::Resolved(value) = previous {
                value.release();
                released += 1;
            }
        }
        debug!(cache = %self.name, released, "object cache cleared");
        released
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Bitmap {
        released: Arc<AtomicUsize>,
    }

    impl Releasable for Bitmap {
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sync_get_before_resolve_fails() {
        let cache: ObjectCache<String> = ObjectCache::new("common");
        assert!(matches!(cache.get("font-1"), Err(BobbinError::NotResolved(id)) if id == "font-1"));
        assert!(!cache.has("font-1"));

        cache.resolve("font-1", "Helvetica".into());
        assert_eq!(*cache.get("font-1").unwrap(), "Helvetica");
        assert!(cache.has("font-1"));
    }

    #[tokio::test]
    async fn async_get_completes_after_late_resolve() {
        let cache = Arc::new(ObjectCache::<String>::new("page1"));

        let waiter = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get_async("img-7").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert!(cache.resolve("img-7", "pixels".into()));
        assert_eq!(*waiter.await.unwrap().unwrap(), "pixels");
    }

    #[tokio::test]
    async fn second_resolve_is_ignored() {
        let cache = ObjectCache::<String>::new("common");
        assert!(cache.resolve("f", "v1".into()));
        let early = cache.get_async("f").await.unwrap();

        assert!(!cache.resolve("f", "v2".into()));
        assert_eq!(*early, "v1");
        assert_eq!(*cache.get("f").unwrap(), "v1");
    }

    #[tokio::test]
    async fn clear_releases_values_and_fails_waiters() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ObjectCache::<Bitmap>::new("page2"));
        cache.resolve(
            "img-1",
            Bitmap {
                released: Arc::clone(&released),
            },
        );

        let waiter = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get_async("img-2").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.clear(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(matches!(waiter.await.unwrap(), Err(BobbinError::CacheCleared(_))));
        assert!(cache.is_empty());
    }
}
