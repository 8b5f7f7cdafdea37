//! EndpointBuilder - endpoint の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 束縛は build 時点で確定し、以後は変更できない

use std::sync::Arc;

use super::endpoint::Endpoint;
use crate::config::StreamPolicy;
use crate::domain::DocumentId;
use crate::error::BobbinError;
use crate::ports::Transport;
use crate::typed::{
    Action, ActionRegistry, Binding, Handler, StreamAction, StreamHandler,
};

/// チャネルのどちら側か
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Worker,
}

impl Role {
    pub fn endpoint_name(self, document: DocumentId) -> String {
        match self {
            Role::Host => format!("host-{}", document.as_ulid()),
            Role::Worker => format!("worker-{}", document.as_ulid()),
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Worker,
            Role::Worker => Role::Host,
        }
    }
}

/// EndpointBuilder は handler を束縛して Dispatcher を作る
///
/// # 使用例
/// ```ignore
/// let endpoint = EndpointBuilder::for_document(Role::Worker, doc_id)
///     .register::<GetNumPages, _>(NumPages(12))?
///     .register_stream::<GetOperatorList, _>(Producer::new())?
///     .expect_actions(&[GetNumPages::NAME, GetOperatorList::NAME])
///     .build()?
///     .connect(Arc::new(port));
/// ```
///
/// # Fail-fast 設計
/// - 同じ action を 2 回束縛すると `DuplicateAction`
/// - `expect_actions()` で期待した action が 1 つでも欠けていたら build が `MissingActions`
pub struct EndpointBuilder {
    name: String,
    peer: String,
    registry: ActionRegistry,
    expected_actions: Option<Vec<String>>,
    policy: StreamPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("missing actions: {0:?}. These actions were expected but not bound.")]
    MissingActions(Vec<String>),
}

impl EndpointBuilder {
    pub fn new(name: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peer: peer.into(),
            registry: ActionRegistry::new(),
            expected_actions: None,
            policy: StreamPolicy::default_v1(),
        }
    }

    /// `host-<doc>` / `worker-<doc>` の名前で作る
    pub fn for_document(role: Role, document: DocumentId) -> Self {
        Self::new(role.endpoint_name(document), role.peer().endpoint_name(document))
    }

    pub fn register<A: Action, H: Handler<A> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, BobbinError> {
        self.registry.register::<A, H>(handler)?;
        Ok(self)
    }

    pub fn register_stream<A: StreamAction, H: StreamHandler<A> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, BobbinError> {
        self.registry.register_stream::<A, H>(handler)?;
        Ok(self)
    }

    /// 型消去済みの handler を直接束縛する
    pub fn bind(mut self, action: &str, binding: Binding) -> Result<Self, BobbinError> {
        self.registry.bind(action, binding)?;
        Ok(self)
    }

    pub fn expect_actions(mut self, actions: &[&str]) -> Self {
        self.expected_actions = Some(actions.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn with_stream_policy(mut self, policy: StreamPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 期待された action が全部束縛されているか確かめて Dispatcher を作る
    pub fn build(self) -> Result<Dispatcher, BuildError> {
        if let Some(expected) = &self.expected_actions {
            let missing: Vec<String> = expected
                .iter()
                .filter(|action| !self.registry.contains(action))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingActions(missing));
            }
        }
        Ok(Dispatcher {
            name: self.name,
            peer: self.peer,
            registry: self.registry,
            policy: self.policy,
        })
    }
}

/// Dispatcher は束縛が確定した endpoint の設計図
///
/// `connect()` で transport につなぐと read loop が動き出す（tokio runtime が必要）。
pub struct Dispatcher {
    pub(crate) name: String,
    pub(crate) peer: String,
    pub(crate) registry: ActionRegistry,
    pub(crate) policy: StreamPolicy,
}

impl Dispatcher {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn connect(self, transport: Arc<dyn Transport>) -> Endpoint {
        Endpoint::spawn(self, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use ulid::Ulid;

    #[derive(Serialize, Deserialize)]
    struct Hello;

    impl Action for Hello {
        const NAME: &'static str = "Hello";
        type Response = String;
    }

    struct HelloHandler;

    #[async_trait]
    impl Handler<Hello> for HelloHandler {
        async fn handle(&self, _request: Hello) -> Result<String, BobbinError> {
            Ok("hello".into())
        }
    }

    #[test]
    fn build_success() {
        let dispatcher = EndpointBuilder::new("worker-a", "host-a")
            .register::<Hello, _>(HelloHandler)
            .unwrap()
            .expect_actions(&[Hello::NAME])
            .build();
        assert!(dispatcher.is_ok());
    }

    #[test]
    fn build_reports_missing_actions() {
        let dispatcher = EndpointBuilder::new("worker-a", "host-a")
            .register::<Hello, _>(HelloHandler)
            .unwrap()
            .expect_actions(&[Hello::NAME, "GetOperatorList"])
            .build();
        assert!(matches!(
            dispatcher,
            Err(BuildError::MissingActions(missing)) if missing == vec!["GetOperatorList".to_string()]
        ));
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let result = EndpointBuilder::new("worker-a", "host-a")
            .register::<Hello, _>(HelloHandler)
            .unwrap()
            .register::<Hello, _>(HelloHandler);
        assert!(matches!(result, Err(BobbinError::DuplicateAction(name)) if name == "Hello"));
    }

    #[test]
    fn document_roles_name_both_ends() {
        let doc = DocumentId::from_ulid(Ulid::new());
        let builder = EndpointBuilder::for_document(Role::Host, doc);
        let dispatcher = builder.build().unwrap();

        assert_eq!(dispatcher.name(), format!("host-{}", doc.as_ulid()));
        assert_eq!(dispatcher.peer, format!("worker-{}", doc.as_ulid()));
    }
}
