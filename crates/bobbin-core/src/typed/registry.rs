//! ActionRegistry - action 名から handler への束縛
//!
//! endpoint を作る前に全部登録して、以後は変更しない。
//! 同じ action 名を 2 回束縛しようとするとエラーになる。

use std::collections::HashMap;
use std::sync::Arc;

use super::action::{Action, StreamAction};
use super::handler::{
    DynHandler, DynStreamHandler, Handler, StreamHandler, TypedHandler, TypedStreamHandler,
};

/// 1 つの ActionBinding の中身
#[derive(Clone)]
pub enum Binding {
    /// request/response と通知
    Call(Arc<dyn DynHandler>),
    /// stream を開く action
    Stream(Arc<dyn DynStreamHandler>),
}

impl Binding {
    pub fn kind(&self) -> &'static str {
        match self {
            Binding::Call(_) => "call",
            Binding::Stream(_) => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("action '{0}' is already bound")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct ActionRegistry {
    bindings: HashMap<String, Binding>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 型消去済みの handler をそのまま束縛する
    pub fn bind(&mut self, action: &str, binding: Binding) -> Result<(), RegistryError> {
        if self.bindings.contains_key(action) {
            return Err(RegistryError::AlreadyRegistered(action.to_string()));
        }
        self.bindings.insert(action.to_string(), binding);
        Ok(())
    }

    pub fn register<A: Action, H: Handler<A> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let typed = TypedHandler::<A, H>::new(handler);
        self.bind(A::NAME, Binding::Call(Arc::new(typed)))
    }

    pub fn register_stream<A: StreamAction, H: StreamHandler<A> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let typed = TypedStreamHandler::<A, H>::new(handler);
        self.bind(A::NAME, Binding::Stream(Arc::new(typed)))
    }

    pub fn get(&self, action: &str) -> Option<&Binding> {
        self.bindings.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.bindings.contains_key(action)
    }

    pub fn registered_actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }
}
