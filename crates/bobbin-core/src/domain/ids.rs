//! Domain identifiers (strongly-typed IDs).
//!
//! # 2 種類の ID
//! - **`Id<T>`**: ULID ベース。ドキュメント（セッション）単位の識別子に使う。
//! - **`SeqId<T>`**: endpoint ごとに 1 から単調増加する相関 ID（callId / streamId）。
//!   wire 上ではただの整数として流れる。
//!
//! どちらも Phantom type パターンで `T` をマーカーにしているので、
//! `CallId` と `StreamId` を取り違えるとコンパイルエラーになる。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"doc-", "call-", "stream-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID ベースのジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// endpoint ローカルな連番 ID
///
/// wire 上は `u64` そのもの（`#[serde(transparent)]`）。
/// 0 は「未割り当て」を表すので発行しない。
#[repr(transparent)]
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct SeqId<T: IdMarker> {
    value: u64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> SeqId<T> {
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub const fn get(self) -> u64 {
        self.value
    }
}

// derive だと `T: Clone` などの余計な境界が付くので手で書く
impl<T: IdMarker> Clone for SeqId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for SeqId<T> {}

impl<T: IdMarker> PartialEq for SeqId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: IdMarker> Eq for SeqId<T> {}

impl<T: IdMarker> std::hash::Hash for SeqId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for SeqId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for SeqId<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: IdMarker> fmt::Debug for SeqId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

impl<T: IdMarker> fmt::Display for SeqId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Document {}

impl IdMarker for Document {
    fn prefix() -> &'static str {
        "doc-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Call {}

impl IdMarker for Call {
    fn prefix() -> &'static str {
        "call-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {}

impl IdMarker for Stream {
    fn prefix() -> &'static str {
        "stream-"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identifier of a document session (names both endpoints of one channel).
pub type DocumentId = Id<Document>;

/// Correlation id of a request/response call.
pub type CallId = SeqId<Call>;

/// Correlation id of a stream (shared by its sink and controller).
pub type StreamId = SeqId<Stream>;

/// Zero-based index of a page view.
///
/// Display は 1 始まりのページ番号（"page3" など）で、ログの renderingId として使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(pub usize);

impl ViewId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// 1-based page number.
    pub const fn page_number(self) -> usize {
        self.0 + 1
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page{}", self.page_number())
    }
}
