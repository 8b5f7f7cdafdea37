//! Typed - 型付き Action API
//!
//! action 名の typo を型で排除し、handler との対応付けを静的に保証する。
//!
//! # 二層構造
//! - **表層（Typed）**: `Action` / `StreamAction` trait, `Handler<A>` / `StreamHandler<A>` - 型安全
//! - **内部（Dyn）**: `DynHandler` / `DynStreamHandler` - object-safe, type erasure
//!
//! endpoint は内部層だけを見て、JSON の `Value` で handler を呼ぶ。

pub mod action;
pub mod codec;
pub mod handler;
pub mod registry;

pub use self::action::{Action, StreamAction};
pub use self::handler::{DynHandler, DynStreamHandler, Handler, StreamHandler};
pub use self::registry::{ActionRegistry, Binding, RegistryError};
