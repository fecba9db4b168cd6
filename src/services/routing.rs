//! 能力路由 - 业务能力层
//!
//! 按能力挑选"最好"的厂商配置。查询本身从不替调用方降级，
//! 回退链（"thinking，否则 standard"）由调用方显式给出。

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{AppError, AppResult, ConfigError};
use crate::infrastructure::Database;
use crate::models::{Capability, ProviderConfig};

/// 能力路由器
pub struct CapabilityRouter {
    store: Arc<Database>,
}

impl CapabilityRouter {
    pub fn new(store: Arc<Database>) -> Self {
        Self { store }
    }

    /// 某能力下权重最高的启用模型（所在厂商也必须启用）
    pub fn best_config_for(&self, capability: Capability) -> AppResult<Option<ProviderConfig>> {
        let config = self.store.best_config_for(capability)?;
        match &config {
            Some(c) => debug!(
                "能力 {} -> 厂商 [{}] 模型 {}",
                capability, c.provider_name, c.model_name
            ),
            None => debug!("能力 {} 没有可用模型", capability),
        }
        Ok(config)
    }

    /// 单一能力，没有可用模型时报"服务不可用"
    pub fn require(&self, capability: Capability) -> AppResult<ProviderConfig> {
        self.best_config_for(capability)?
            .ok_or_else(|| AppError::no_provider(capability))
    }

    /// 依次尝试回退链上的能力，返回第一个可用配置
    pub fn resolve_chain(&self, chain: &[Capability]) -> AppResult<ProviderConfig> {
        for (idx, capability) in chain.iter().enumerate() {
            if let Some(config) = self.best_config_for(*capability)? {
                if idx > 0 {
                    info!(
                        "⚠️  能力 {} 无可用模型，回退到 {} ({})",
                        chain[0], capability, config.model_name
                    );
                }
                return Ok(config);
            }
        }
        Err(ConfigError::NoProviderInChain {
            chain: format_chain(chain),
        }
        .into())
    }
}

pub fn format_chain(chain: &[Capability]) -> String {
    chain
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProtocolKind;

    fn router_with_standard_only() -> CapabilityRouter {
        let db = Database::open_in_memory().unwrap();
        let pid = db
            .add_provider("deepseek", ProtocolKind::ChatCompletions, "https://api.deepseek.com", "sk", 2)
            .unwrap();
        db.add_model(pid, "deepseek-chat", Capability::Standard, 10, false)
            .unwrap();
        CapabilityRouter::new(Arc::new(db))
    }

    #[test]
    fn test_query_never_substitutes_capability() {
        let router = router_with_standard_only();
        assert!(router.best_config_for(Capability::Thinking).unwrap().is_none());
    }

    #[test]
    fn test_explicit_fallback_picks_standard_model() {
        let router = router_with_standard_only();
        let config = router
            .resolve_chain(&[Capability::Thinking, Capability::Standard])
            .unwrap();
        assert_eq!(config.capability, Capability::Standard);
        assert_eq!(config.model_name, "deepseek-chat");
    }

    #[test]
    fn test_exhausted_chain_is_config_error() {
        let router = router_with_standard_only();
        let err = router.resolve_chain(&[Capability::Vision]).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("vision"));

        let err = router.require(Capability::Thinking).unwrap_err();
        assert!(matches!(
            err,
            AppError::Config(ConfigError::NoProvider {
                capability: Capability::Thinking
            })
        ));
    }
}
