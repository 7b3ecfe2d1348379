//! Provider Registry (A): the declarative catalog of upstream endpoints.
//!
//! Loaded once at startup into an immutable structure; every fallback-chain
//! lookup after that is a plain `Vec` scan, never a write.

use std::collections::HashMap;

use crate::config::ProviderSpec;
use crate::error::GatewayError;
use crate::types::Category;

pub struct Registry {
    by_category: HashMap<Category, Vec<ProviderSpec>>,
    by_id: HashMap<String, ProviderSpec>,
}

impl Registry {
    /// Validates and builds the registry from a flat list of specs.
    ///
    /// Fails if: two providers in the same category share a priority, a
    /// `parser_id` is not in `known_parser_ids`. Providers whose auth
    /// references an unset/empty env var are dropped silently (not a
    /// startup error) per the registry-load skip policy.
    pub fn load(
        specs: Vec<ProviderSpec>,
        known_parser_ids: &[&str],
    ) -> Result<Self, GatewayError> {
        let mut by_category: HashMap<Category, Vec<ProviderSpec>> = HashMap::new();
        let mut by_id = HashMap::new();
        let mut seen_priority: HashMap<(Category, i32), String> = HashMap::new();

        for spec in specs {
            if !known_parser_ids.contains(&spec.parser_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "provider {} references unknown parser_id {}",
                    spec.id, spec.parser_id
                )));
            }
            if spec.resolve_auth().is_err() {
                tracing::info!(provider_id = %spec.id, "skipping provider at load: auth env var unset or empty");
                continue;
            }
            // Only providers that survive the auth-skip above ever occupy a
            // priority slot, so this check is independent of input order.
            if let Some(existing) = seen_priority.get(&(spec.category, spec.priority)) {
                return Err(GatewayError::Config(format!(
                    "providers {} and {} share priority {} in category {}",
                    existing, spec.id, spec.priority, spec.category
                )));
            }
            seen_priority.insert((spec.category, spec.priority), spec.id.clone());
            by_id.insert(spec.id.clone(), spec.clone());
            by_category.entry(spec.category).or_default().push(spec);
        }

        for chain in by_category.values_mut() {
            chain.sort_by_key(|s| s.priority);
        }

        Ok(Self { by_category, by_id })
    }

    /// Ordered fallback chain for a category, ascending priority.
    pub fn chain_for(&self, category: Category) -> &[ProviderSpec] {
        self.by_category.get(&category).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn get(&self, id: &str) -> Option<&ProviderSpec> {
        self.by_id.get(id)
    }

    pub fn all_categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.by_category.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthSpec, RateLimitSpec};

    fn spec(id: &str, category: Category, priority: i32) -> ProviderSpec {
        ProviderSpec {
            id: id.to_string(),
            category,
            base_url: "https://example.com".to_string(),
            auth: AuthSpec::None,
            timeout_ms: None,
            priority,
            rate_limit: RateLimitSpec {
                max_tokens: 10.0,
                refill_per_window: 10.0,
                window_ms: 1000,
            },
            parser_id: "identity".to_string(),
            default_path: None,
            max_retries: None,
        }
    }

    #[test]
    fn chain_is_sorted_by_priority() {
        let specs = vec![
            spec("p2", Category::Market, 2),
            spec("p1", Category::Market, 1),
        ];
        let reg = Registry::load(specs, &["identity"]).unwrap();
        let chain = reg.chain_for(Category::Market);
        assert_eq!(chain[0].id, "p1");
        assert_eq!(chain[1].id, "p2");
    }

    #[test]
    fn duplicate_priority_in_category_is_rejected() {
        let specs = vec![
            spec("p1", Category::Market, 1),
            spec("p2", Category::Market, 1),
        ];
        assert!(Registry::load(specs, &["identity"]).is_err());
    }

    #[test]
    fn unknown_parser_id_is_rejected() {
        let mut s = spec("p1", Category::Market, 1);
        s.parser_id = "no_such_parser".to_string();
        assert!(Registry::load(vec![s], &["identity"]).is_err());
    }

    #[test]
    fn provider_with_missing_auth_env_is_skipped_not_fatal() {
        let mut s = spec("p1", Category::Market, 1);
        s.auth = AuthSpec::Header {
            name: "X-Api-Key".into(),
            env: "CRYPTO_GATEWAY_TEST_UNSET_VAR_ABC".into(),
        };
        let reg = Registry::load(vec![s], &["identity"]).unwrap();
        assert!(reg.chain_for(Category::Market).is_empty());
        assert!(reg.get("p1").is_none());
    }

    #[test]
    fn duplicate_priority_is_allowed_when_the_colliding_provider_is_auth_skipped() {
        let mut skipped = spec("p1", Category::Market, 1);
        skipped.auth = AuthSpec::Header {
            name: "X-Api-Key".into(),
            env: "CRYPTO_GATEWAY_TEST_UNSET_VAR_DEF".into(),
        };
        let kept = spec("p2", Category::Market, 1);

        // Order must not matter: the skipped provider never occupies the
        // priority slot regardless of whether it's processed before or
        // after the provider it would otherwise collide with.
        let reg = Registry::load(vec![skipped.clone(), kept.clone()], &["identity"]).unwrap();
        assert_eq!(reg.chain_for(Category::Market).len(), 1);
        assert_eq!(reg.chain_for(Category::Market)[0].id, "p2");

        let reg = Registry::load(vec![kept, skipped], &["identity"]).unwrap();
        assert_eq!(reg.chain_for(Category::Market).len(), 1);
        assert_eq!(reg.chain_for(Category::Market)[0].id, "p2");
    }

    #[test]
    fn same_priority_different_category_is_allowed() {
        let specs = vec![
            spec("p1", Category::Market, 1),
            spec("p2", Category::News, 1),
        ];
        let reg = Registry::load(specs, &["identity"]).unwrap();
        assert_eq!(reg.chain_for(Category::Market).len(), 1);
        assert_eq!(reg.chain_for(Category::News).len(), 1);
    }
}
