//! Document actions - host と worker が共有する action の型
//!
//! | action            | 種類          | 向き            |
//! |-------------------|---------------|-----------------|
//! | `GetNumPages`     | call          | host → worker   |
//! | `GetDestination`  | call          | host → worker   |
//! | `GetOperatorList` | stream        | host → worker   |
//! | `commonobj`       | notification  | worker → host   |
//! | `obj`             | notification  | worker → host   |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::object_cache::Releasable;
use crate::domain::{OperatorListChunk, RenderIntent};
use crate::typed::{Action, StreamAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNumPages;

impl Action for GetNumPages {
    const NAME: &'static str = "GetNumPages";
    type Response = u32;
}

/// 名前つき destination を引く（無ければ `None`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDestination {
    pub name: String,
}

impl Action for GetDestination {
    const NAME: &'static str = "GetDestination";
    type Response = Option<Value>;
}

/// 1 ページ分の operator list を chunk で受け取る
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOperatorList {
    pub page_index: usize,
    pub intent: RenderIntent,
}

impl StreamAction for GetOperatorList {
    const NAME: &'static str = "GetOperatorList";
    type Chunk = OperatorListChunk;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Font,
    FontPath,
    Image,
}

/// worker から届いた共有リソース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedObject {
    pub kind: ObjectKind,
    pub data: Value,
}

impl Releasable for SharedObject {}

/// ドキュメント全体で共有されるリソース（フォントなど）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonObj {
    pub id: String,
    pub kind: ObjectKind,
    pub data: Value,
}

impl Action for CommonObj {
    const NAME: &'static str = "commonobj";
    type Response = ();
}

/// 1 ページだけで使うリソース（画像など）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageObj {
    pub id: String,
    pub page_index: usize,
    pub kind: ObjectKind,
    pub data: Value,
}

impl Action for PageObj {
    const NAME: &'static str = "obj";
    type Response = ();
}
