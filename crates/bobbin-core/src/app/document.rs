//! DocumentProxy - host 側で 1 ドキュメント分をまとめるファサード
//!
//! - host endpoint を作り、`commonobj` / `obj` 通知を ObjectCache に流し込む
//! - `GetNumPages` で view 数を決め、view ごとの surface で RenderDriver を起動する
//! - operator list は `GetOperatorList` stream で受け取る
//! - `destroy()` で描画を止め、cache を捨て、endpoint を閉じる

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::actions::{CommonObj, GetDestination, GetNumPages, GetOperatorList, PageObj, SharedObject};
use super::builder::{EndpointBuilder, Role};
use super::endpoint::Endpoint;
use super::lock;
use super::object_cache::ObjectCache;
use super::render_driver::{RenderDriver, RenderDriverHandle, ViewReport};
use super::render_task::{RenderError, TaskKey};
use super::rendering_queue::VisibleViews;
use super::stream::{QueueingStrategy, StreamReader};
use crate::config::SessionConfig;
use crate::domain::{DocumentId, OperatorListChunk, RemoteError, RenderIntent, ViewId};
use crate::error::BobbinError;
use crate::ports::{OperatorListSource, OperatorListStream, PageSurface, Transport};
use crate::typed::Handler;

/// ページごとの ObjectCache（必要になった時点で作る）
#[derive(Default)]
struct PageObjects {
    caches: Mutex<HashMap<ViewId, Arc<ObjectCache<SharedObject>>>>,
}

impl PageObjects {
    fn get_or_create(&self, view: ViewId) -> Arc<ObjectCache<SharedObject>> {
        let mut caches = lock(&self.caches);
        Arc::clone(
            caches
                .entry(view)
                .or_insert_with(|| Arc::new(ObjectCache::new(view.to_string()))),
        )
    }

    /// 指定した view の cache を捨てる。解放した値の数を返す。
    fn release(&self, views: &[ViewId]) -> usize {
        let caches: Vec<_> = {
            let caches = lock(&self.caches);
            views.iter().filter_map(|view| caches.get(view).cloned()).collect()
        };
        caches.iter().map(|cache| cache.clear()).sum()
    }

    fn clear_all(&self) -> usize {
        let caches: Vec<_> = lock(&self.caches).drain().map(|(_, cache)| cache).collect();
        caches.iter().map(|cache| cache.clear()).sum()
    }
}

struct CommonObjHandler {
    cache: Arc<ObjectCache<SharedObject>>,
}

#[async_trait]
impl Handler<CommonObj> for CommonObjHandler {
    async fn handle(&self, request: CommonObj) -> Result<(), BobbinError> {
        // 同じ id が複数ページから届くことがある。最初の 1 つだけ使う
        if !self.cache.has(&request.id) {
            self.cache.resolve(
                &request.id,
                SharedObject {
                    kind: request.kind,
                    data: request.data,
                },
            );
        }
        Ok(())
    }
}

struct PageObjHandler {
    pages: Arc<PageObjects>,
}

#[async_trait]
impl Handler<PageObj> for PageObjHandler {
    async fn handle(&self, request: PageObj) -> Result<(), BobbinError> {
        let cache = self.pages.get_or_create(ViewId::new(request.page_index));
        if !cache.has(&request.id) {
            cache.resolve(
                &request.id,
                SharedObject {
                    kind: request.kind,
                    data: request.data,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl OperatorListStream for StreamReader<OperatorListChunk> {
    async fn read(&self) -> Result<Option<OperatorListChunk>, RemoteError> {
        StreamReader::<OperatorListChunk>::read(self).await
    }

    async fn cancel(&self, reason: RemoteError) -> Result<(), RemoteError> {
        StreamReader::<OperatorListChunk>::cancel(self, reason).await
    }
}

/// `GetOperatorList` stream を開く OperatorListSource
pub struct EndpointOperatorListSource {
    endpoint: Endpoint,
    strategy: QueueingStrategy,
}

impl EndpointOperatorListSource {
    pub fn new(endpoint: Endpoint, strategy: QueueingStrategy) -> Self {
        Self { endpoint, strategy }
    }
}

impl OperatorListSource for EndpointOperatorListSource {
    fn open(&self, view: ViewId, intent: RenderIntent) -> Result<Arc<dyn OperatorListStream>, RemoteError> {
        let request = GetOperatorList {
            page_index: view.index(),
            intent,
        };
        let reader = self
            .endpoint
            .stream_typed(&request, self.strategy)
            .map_err(BobbinError::into_remote)?;
        Ok(Arc::new(reader))
    }
}

pub struct DocumentProxy {
    document: DocumentId,
    endpoint: Endpoint,
    num_pages: u32,
    common_objs: Arc<ObjectCache<SharedObject>>,
    page_objs: Arc<PageObjects>,
    driver: RenderDriverHandle,
}

impl DocumentProxy {
    /// host endpoint をつなぎ、ページ数を問い合わせて描画の準備をする
    ///
    /// `make_surface` は view ごとに 1 回呼ばれる。
    pub async fn open<F>(
        transport: Arc<dyn Transport>,
        document: DocumentId,
        config: SessionConfig,
        mut make_surface: F,
    ) -> Result<Self, BobbinError>
    where
        F: FnMut(ViewId) -> Box<dyn PageSurface>,
    {
        config.validate()?;
        let common_objs = Arc::new(ObjectCache::new("common"));
        let page_objs = Arc::new(PageObjects::default());

        let endpoint = EndpointBuilder::for_document(Role::Host, document)
            .with_stream_policy(config.stream.clone())
            .register::<CommonObj, _>(CommonObjHandler {
                cache: Arc::clone(&common_objs),
            })?
            .register::<PageObj, _>(PageObjHandler {
                pages: Arc::clone(&page_objs),
            })?
            .build()?
            .connect(transport);

        let num_pages = match endpoint.call_typed(&GetNumPages).await {
            Ok(n) => n,
            Err(err) => {
                endpoint.destroy();
                return Err(err);
            }
        };

        let surfaces = (0..num_pages as usize)
            .map(|index| make_surface(ViewId::new(index)))
            .collect();
        let source = Arc::new(EndpointOperatorListSource::new(
            endpoint.clone(),
            QueueingStrategy::from_policy(&config.stream),
        ));
        let driver = match RenderDriver::new(surfaces, source, &config) {
            Ok(driver) => driver,
            Err(err) => {
                endpoint.destroy();
                return Err(err);
            }
        };
        let idle_pages = Arc::clone(&page_objs);
        let driver = driver
            .on_idle(move |views| {
                let released = idle_pages.release(views);
                debug!(released, "released page objects of idle views");
            })
            .spawn();

        info!(%document, num_pages, "document opened");
        Ok(Self {
            document,
            endpoint,
            num_pages,
            common_objs,
            page_objs,
            driver,
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn driver(&self) -> &RenderDriverHandle {
        &self.driver
    }

    pub async fn get_destination(&self, name: &str) -> Result<Option<Value>, BobbinError> {
        self.endpoint
            .call_typed(&GetDestination {
                name: name.to_string(),
            })
            .await
    }

    pub fn common_objs(&self) -> &ObjectCache<SharedObject> {
        &self.common_objs
    }

    pub fn page_objs(&self, view: ViewId) -> Arc<ObjectCache<SharedObject>> {
        self.page_objs.get_or_create(view)
    }

    pub fn update_visibility(&self, visible: VisibleViews, scrolled_down: bool) -> Result<(), BobbinError> {
        self.driver.update_visibility(visible, scrolled_down)
    }

    pub fn update_from_surfaces(&self, scrolled_down: bool) -> Result<(), BobbinError> {
        self.driver.update_from_surfaces(scrolled_down)
    }

    /// display の描画が終わるまで待つ
    pub async fn wait_rendered(&self, view: ViewId) -> Result<(), RenderError> {
        self.driver.wait_finished(TaskKey::display(view)).await
    }

    pub async fn render_print(&self, view: ViewId) -> Result<(), RenderError> {
        self.driver.render_print(view).await
    }

    pub fn set_printing(&self, printing: bool) -> Result<(), BobbinError> {
        self.driver.set_printing(printing)
    }

    pub fn cancel(&self, key: TaskKey) -> Result<(), BobbinError> {
        self.driver.cancel(key)
    }

    pub fn reset(&self, view: ViewId) -> Result<(), BobbinError> {
        self.driver.reset(view)
    }

    pub async fn states(&self) -> Result<Vec<ViewReport>, BobbinError> {
        self.driver.snapshot().await
    }

    /// 全タスクを止め、ストリームを即座に cancel し、cache を捨てて endpoint を閉じる
    pub async fn destroy(&self) {
        self.driver.shutdown_and_join().await;
        let released = self.common_objs.clear() + self.page_objs.clear_all();
        self.endpoint.destroy();
        info!(document = %self.document, released, "document destroyed");
    }
}
