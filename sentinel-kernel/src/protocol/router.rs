use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::messages::{MessageKind, NormalizedMessage, WireKind};
use super::ConnectionContext;
use crate::error::{KernelError, KernelResult};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &ConnectionContext, message: NormalizedMessage) -> KernelResult<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("no handler registered for message kind '{0}'")]
    MissingHandler(MessageKind),
}

#[derive(Default)]
pub struct RouterBuilder {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl RouterBuilder {
    pub fn on(mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Fails unless every [`MessageKind`] has a handler.
    pub fn build(self) -> Result<Router, RouterError> {
        if let Some(missing) = MessageKind::ALL.into_iter().find(|kind| !self.handlers.contains_key(kind)) {
            return Err(RouterError::MissingHandler(missing));
        }
        Ok(Router { handlers: self.handlers })
    }
}

pub struct Router {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn route(&self, kind: &WireKind) -> KernelResult<(MessageKind, Arc<dyn MessageHandler>)> {
        match kind {
            WireKind::Known(kind) => self
                .handlers
                .get(kind)
                .cloned()
                .map(|handler| (*kind, handler))
                .ok_or_else(|| KernelError::UnknownMessageKind(kind.to_string())),
            WireKind::Unknown(raw) => Err(KernelError::UnknownMessageKind(raw.clone())),
        }
    }
}
