use std::collections::HashMap;

use async_trait::async_trait;
use stepwise_core::domain::state::ConversationState;
use stepwise_core::errors::ApplicationError;
use tokio::sync::RwLock;

/// Persistence boundary for conversation threads.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, ApplicationError>;

    async fn save(
        &self,
        thread_id: &str,
        state: &ConversationState,
    ) -> Result<(), ApplicationError>;
}

#[derive(Default)]
pub struct InMemoryThreadStore {
    threads: RwLock<HashMap<String, ConversationState>>,
}

impl InMemoryThreadStore {
    pub async fn thread_ids(&self) -> Vec<String> {
        let mut ids = self.threads.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, ApplicationError> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn save(
        &self,
        thread_id: &str,
        state: &ConversationState,
    ) -> Result<(), ApplicationError> {
        self.threads.write().await.insert(thread_id.to_string(), state.clone());
        Ok(())
    }
}
