//! Domain model (IDs, envelopes, error taxonomy, render states, operator lists).
//!
//! ここは transport や tokio を知らない純粋な型だけを置く。

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod operator_list;
pub mod state;

pub use self::envelope::{Envelope, StreamKind};
pub use self::errors::{RemoteError, WireError};
pub use self::ids::{CallId, DocumentId, StreamId, ViewId};
pub use self::operator_list::{OperatorList, OperatorListChunk};
pub use self::state::{RenderIntent, RenderingState};
