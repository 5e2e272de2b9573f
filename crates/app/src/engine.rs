//! Shared collaborators handed to every service.

use std::sync::Arc;

use passbook::{clock::Clock, policy::CurrentDepositPolicy};

use crate::{config::EngineConfig, consistency::ConsistencyGuard, database::Db};

/// Store, time source, deposit policy and configuration shared by the
/// services. Cloning shares the same store.
#[derive(Debug, Clone)]
pub struct Engine {
    pub db: Db,
    pub clock: Arc<dyn Clock>,
    pub policy: Arc<dyn CurrentDepositPolicy>,
    pub config: EngineConfig,
    pub guard: ConsistencyGuard,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn CurrentDepositPolicy>,
    ) -> Self {
        Self {
            db: Db::new(config.lock_timeout),
            clock,
            policy,
            config,
            guard: ConsistencyGuard::new(),
        }
    }
}
