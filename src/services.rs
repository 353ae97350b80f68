//! Wiring of the provider, the stores and the agents.

use crate::assistant::PersonalAssistant;
use crate::config::AssistantConfig;
use crate::gemini::GeminiClient;
use crate::llm::LlmProvider;
use crate::makers::{BudgetSlots, GoalSlots, MakerAgent, TransactionSlots};
use crate::memory::ConversationMemory;
use crate::store::{FinanceStore, PgFinanceStore, UnavailableStore};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Services {
    pub assistant: PersonalAssistant,
    pub goal_maker: MakerAgent<GoalSlots>,
    pub budget_maker: MakerAgent<BudgetSlots>,
    pub transaction_maker: MakerAgent<TransactionSlots>,
}

impl Services {
    pub fn from_config(config: &AssistantConfig) -> crate::Result<Self> {
        let llm: Arc<dyn LlmProvider> = Arc::new(GeminiClient::new(
            config.gemini_api_key.clone(),
            config.gemini_model.clone(),
            config.llm_max_retries,
        )?);

        let (store, memory): (Arc<dyn FinanceStore>, ConversationMemory) = match &config.database_url {
            Some(url) => {
                let store = PgFinanceStore::connect_lazy(url, config.db_max_connections)?;
                let memory = ConversationMemory::postgres(store.pool().clone());
                info!(max_connections = config.db_max_connections, "Finance store: postgres");
                (Arc::new(store) as Arc<dyn FinanceStore>, memory)
            }
            None => {
                warn!("No DATABASE_URL configured; data lookups will report an error");
                (Arc::new(UnavailableStore) as Arc<dyn FinanceStore>, ConversationMemory::in_memory())
            }
        };

        Ok(Self::build(llm, store, Arc::new(memory), config))
    }

    pub fn build(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn FinanceStore>,
        memory: Arc<ConversationMemory>,
        config: &AssistantConfig,
    ) -> Self {
        let window = config.conversation_window;
        Self {
            assistant: PersonalAssistant::new(llm.clone(), store.clone(), memory.clone(), config),
            goal_maker: MakerAgent::new(llm.clone(), store.clone(), memory.clone(), window),
            budget_maker: MakerAgent::new(llm.clone(), store.clone(), memory.clone(), window),
            transaction_maker: MakerAgent::new(llm, store, memory, window),
        }
    }
}
