//! Action traits - action 名と型の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Associated Types（返信の型 / chunk の型）
//!
//! 呼び出し側と handler 側が同じ型を共有するので、action 名の typo や
//! payload の形のずれはコンパイル時に見つかる。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Action は request/response（または通知）1 種類を表す
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct GetNumPages;
///
/// impl Action for GetNumPages {
///     const NAME: &'static str = "GetNumPages";
///     type Response = u32;
/// }
/// ```
///
/// 通知として使うものは `Response = ()` にする。
pub trait Action: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// StreamAction は chunk を流し続ける action を表す
pub trait StreamAction: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    type Chunk: Serialize + DeserializeOwned + Send + 'static;
}
