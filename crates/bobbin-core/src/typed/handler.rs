//! Handler traits - action を処理する handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<A>`, `StreamHandler<A>`)
//! - Object-safe trait (`DynHandler`, `DynStreamHandler`)
//! - Type erasure パターン (`TypedHandler<A, H>` → `DynHandler`)

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::action::{Action, StreamAction};
use super::codec;
use crate::app::stream::StreamSink;
use crate::error::BobbinError;

/// Handler は request を受けて response を返す
///
/// # 使用例
/// ```ignore
/// struct NumPages(u32);
///
/// #[async_trait]
/// impl Handler<GetNumPages> for NumPages {
///     async fn handle(&self, _req: GetNumPages) -> Result<u32, BobbinError> {
///         Ok(self.0)
///     }
/// }
/// ```
///
/// 返した `Err` は reply の `error` になる。`BobbinError::Remote` 以外は
/// `Unknown` に落とされる。
#[async_trait]
pub trait Handler<A: Action>: Send + Sync {
    async fn handle(&self, request: A) -> Result<A::Response, BobbinError>;
}

/// StreamHandler は sink に chunk を流す
///
/// endpoint は sink を作った時点で `start_complete` を返し、その後で
/// handler を起動する。`Ok(())` で戻ると sink は close され、
/// `Err` で戻ると sink は error で終わる（どちらも close 済みなら no-op）。
#[async_trait]
pub trait StreamHandler<A: StreamAction>: Send + Sync {
    async fn handle(&self, request: A, sink: StreamSink<A::Chunk>) -> Result<(), BobbinError>;
}

/// DynHandler は object-safe な Handler
///
/// `HashMap<String, Binding>` に格納するために型を消す。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: Value) -> Result<Value, BobbinError>;
    fn action(&self) -> &str;
}

#[async_trait]
pub trait DynStreamHandler: Send + Sync {
    async fn handle_dyn(&self, payload: Value, sink: StreamSink<Value>) -> Result<(), BobbinError>;
    fn action(&self) -> &str;
}

pub struct TypedHandler<A: Action, H: Handler<A>> {
    handler: H,
    _marker: PhantomData<fn(A)>,
}

impl<A: Action, H: Handler<A>> TypedHandler<A, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Action, H: Handler<A>> DynHandler for TypedHandler<A, H> {
    async fn handle_dyn(&self, payload: Value) -> Result<Value, BobbinError> {
        let request: A = codec::decode(payload)?;
        let response = self.handler.handle(request).await?;
        codec::encode(&response)
    }

    fn action(&self) -> &str {
        A::NAME
    }
}

pub struct TypedStreamHandler<A: StreamAction, H: StreamHandler<A>> {
    handler: H,
    _marker: PhantomData<fn(A)>,
}

impl<A: StreamAction, H: StreamHandler<A>> TypedStreamHandler<A, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: StreamAction, H: StreamHandler<A>> DynStreamHandler for TypedStreamHandler<A, H> {
    async fn handle_dyn(&self, payload: Value, sink: StreamSink<Value>) -> Result<(), BobbinError> {
        let request: A = codec::decode(payload)?;
        self.handler.handle(request, sink.retype()).await
    }

    fn action(&self) -> &str {
        A::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RemoteError;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Action for Add {
        const NAME: &'static str = "Add";
        type Response = i64;
    }

    struct Adder;

    #[async_trait]
    impl Handler<Add> for Adder {
        async fn handle(&self, request: Add) -> Result<i64, BobbinError> {
            if request.b == 0 {
                return Err(RemoteError::InvalidContent {
                    message: "b must not be zero".into(),
                }
                .into());
            }
            Ok(request.a + request.b)
        }
    }

    #[tokio::test]
    async fn typed_handler_round_trips_json() {
        let handler = TypedHandler::<Add, _>::new(Adder);
        assert_eq!(handler.action(), "Add");

        let out = handler.handle_dyn(json!({"a": 2, "b": 40})).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_codec_error() {
        let handler = TypedHandler::<Add, _>::new(Adder);
        let err = handler.handle_dyn(json!({"a": "two"})).await.unwrap_err();
        assert!(matches!(err, BobbinError::Codec(_)));
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let handler = TypedHandler::<Add, _>::new(Adder);
        let err = handler.handle_dyn(json!({"a": 1, "b": 0})).await.unwrap_err();
        assert_eq!(err.into_remote().name(), "InvalidContent");
    }
}
