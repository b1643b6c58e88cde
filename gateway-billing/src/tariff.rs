use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorDetails};
use crate::mask::mask_api_key;

/// Token and request limits assigned to an API key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    pub name: String,
    pub max_tokens: u64,
    pub max_requests_per_window: u32,
    pub window_seconds: u64,
    pub description: String,
}

impl Tariff {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_tokens == 0 {
            return Err(Error::new(ErrorDetails::InvalidTariff {
                message: format!("`{}`: max_tokens must be positive", self.name),
            }));
        }
        if self.max_requests_per_window == 0 {
            return Err(Error::new(ErrorDetails::InvalidTariff {
                message: format!("`{}`: max_requests_per_window must be positive", self.name),
            }));
        }
        if self.window_seconds == 0 {
            return Err(Error::new(ErrorDetails::InvalidTariff {
                message: format!("`{}`: window_seconds must be positive", self.name),
            }));
        }
        Ok(())
    }
}

/// Named plan presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum TariffPlan {
    Basic,
    Premium,
    Enterprise,
    Unlimited,
}

const PRESET_WINDOW_SECONDS: u64 = 60;

impl TariffPlan {
    /// The fixed limits of this plan.
    pub fn preset(self) -> Tariff {
        let (name, max_tokens, max_requests_per_window, description) = match self {
            TariffPlan::Basic => ("Basic", 10_000, 30, "Basic plan"),
            TariffPlan::Premium => ("Premium", 100_000, 120, "Premium plan"),
            TariffPlan::Enterprise => ("Enterprise", 1_000_000, 600, "Enterprise plan"),
            TariffPlan::Unlimited => ("Unlimited", 10_000_000, 6_000, "Unlimited plan"),
        };
        Tariff {
            name: name.to_string(),
            max_tokens,
            max_requests_per_window,
            window_seconds: PRESET_WINDOW_SECONDS,
            description: description.to_string(),
        }
    }

    pub fn parse(plan_name: &str) -> Result<Self, Error> {
        TariffPlan::from_str(plan_name.trim()).map_err(|_| {
            Error::new(ErrorDetails::UnknownTariffPlan {
                plan_name: plan_name.to_string(),
            })
        })
    }
}

fn default_custom_name() -> String {
    "Custom".to_string()
}

fn default_custom_description() -> String {
    "Custom tariff".to_string()
}

/// Parameters of an explicit tariff override. Rate fields left unset are
/// taken from the default tariff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TariffUpdate {
    pub max_tokens: u64,
    #[serde(default = "default_custom_name")]
    pub name: String,
    #[serde(default = "default_custom_description")]
    pub description: String,
    #[serde(default)]
    pub max_requests_per_window: Option<u32>,
    #[serde(default)]
    pub window_seconds: Option<u64>,
}

impl TariffUpdate {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            name: default_custom_name(),
            description: default_custom_description(),
            max_requests_per_window: None,
            window_seconds: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MaskedTariff {
    pub api_key: String,
    #[serde(flatten)]
    pub tariff: Tariff,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TariffDistribution {
    pub count: u64,
    pub total_tokens: u64,
    pub avg_tokens: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TariffStats {
    pub total_tariffs: usize,
    pub default_max_tokens: u64,
    pub total_max_tokens: u64,
    pub tariff_distribution: BTreeMap<String, TariffDistribution>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TariffValidation {
    pub valid: bool,
    pub api_key: String,
    pub tariff: Tariff,
    pub has_custom_tariff: bool,
    pub using_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Maps API keys to tariffs. Keys without an override get the default tariff.
pub struct TariffRegistry {
    custom: DashMap<String, Arc<Tariff>>,
    default_tariff: ArcSwap<Tariff>,
}

impl TariffRegistry {
    pub fn new(default_tariff: Tariff) -> Result<Self, Error> {
        default_tariff.validate()?;
        Ok(Self {
            custom: DashMap::new(),
            default_tariff: ArcSwap::from_pointee(default_tariff),
        })
    }

    pub fn default_tariff(&self) -> Arc<Tariff> {
        self.default_tariff.load_full()
    }

    pub fn set_default_tariff(&self, tariff: Tariff) -> Result<(), Error> {
        tariff.validate()?;
        info!(
            max_tokens = tariff.max_tokens,
            "Updated default tariff to `{}`", tariff.name
        );
        self.default_tariff.store(Arc::new(tariff));
        Ok(())
    }

    pub fn get_tariff(&self, api_key: &str) -> Arc<Tariff> {
        let tariff = self
            .custom
            .get(api_key)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| self.default_tariff());
        debug!(
            api_key = %mask_api_key(api_key),
            max_tokens = tariff.max_tokens,
            "Retrieved tariff `{}`", tariff.name
        );
        tariff
    }

    pub fn has_custom_tariff(&self, api_key: &str) -> bool {
        self.custom.contains_key(api_key)
    }

    /// Insert or replace the override for `api_key`.
    pub fn set_tariff(&self, api_key: &str, update: TariffUpdate) -> Result<Arc<Tariff>, Error> {
        let defaults = self.default_tariff();
        let tariff = Tariff {
            name: update.name,
            max_tokens: update.max_tokens,
            max_requests_per_window: update
                .max_requests_per_window
                .unwrap_or(defaults.max_requests_per_window),
            window_seconds: update.window_seconds.unwrap_or(defaults.window_seconds),
            description: update.description,
        };
        self.insert(api_key, tariff)
    }

    fn insert(&self, api_key: &str, tariff: Tariff) -> Result<Arc<Tariff>, Error> {
        tariff.validate()?;
        info!(
            api_key = %mask_api_key(api_key),
            max_tokens = tariff.max_tokens,
            max_requests_per_window = tariff.max_requests_per_window,
            "Set tariff `{}`", tariff.name
        );
        let tariff = Arc::new(tariff);
        self.custom.insert(api_key.to_string(), Arc::clone(&tariff));
        Ok(tariff)
    }

    pub fn apply_tariff_plan(&self, api_key: &str, plan: TariffPlan) -> Result<Arc<Tariff>, Error> {
        self.insert(api_key, plan.preset())
    }

    /// Apply a plan given by name, e.g. `"Premium"`.
    pub fn apply_tariff_plan_by_name(
        &self,
        api_key: &str,
        plan_name: &str,
    ) -> Result<Arc<Tariff>, Error> {
        let plan = TariffPlan::parse(plan_name)?;
        self.apply_tariff_plan(api_key, plan)
    }

    /// Drop the override for `api_key`. Returns `false` if there was none.
    pub fn remove_tariff(&self, api_key: &str) -> bool {
        if self.custom.remove(api_key).is_some() {
            info!(api_key = %mask_api_key(api_key), "Removed tariff, default applies");
            true
        } else {
            warn!(api_key = %mask_api_key(api_key), "No custom tariff to remove");
            false
        }
    }

    /// All overrides with masked keys, sorted by key.
    pub fn list_tariffs(&self) -> Vec<MaskedTariff> {
        let mut entries: Vec<(String, Tariff)> = self
            .custom
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().as_ref().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(api_key, tariff)| MaskedTariff {
                api_key: mask_api_key(&api_key),
                tariff,
            })
            .collect()
    }

    pub fn tariff_stats(&self) -> TariffStats {
        let mut tariff_distribution: BTreeMap<String, TariffDistribution> = BTreeMap::new();
        let mut total_max_tokens = 0u64;
        let mut total_tariffs = 0usize;

        for entry in self.custom.iter() {
            let tariff = entry.value();
            total_tariffs += 1;
            total_max_tokens = total_max_tokens.saturating_add(tariff.max_tokens);
            let bucket = tariff_distribution.entry(tariff.name.clone()).or_default();
            bucket.count += 1;
            bucket.total_tokens = bucket.total_tokens.saturating_add(tariff.max_tokens);
        }
        for bucket in tariff_distribution.values_mut() {
            bucket.avg_tokens = bucket.total_tokens / bucket.count;
        }

        TariffStats {
            total_tariffs,
            default_max_tokens: self.default_tariff().max_tokens,
            total_max_tokens,
            tariff_distribution,
        }
    }

    pub fn validate_api_key_tariff(&self, api_key: &str) -> TariffValidation {
        let has_custom_tariff = self.has_custom_tariff(api_key);
        let tariff = self.get_tariff(api_key).as_ref().clone();
        let error = tariff.validate().err().map(|e| e.to_string());
        TariffValidation {
            valid: error.is_none(),
            api_key: mask_api_key(api_key),
            tariff,
            has_custom_tariff,
            using_default: !has_custom_tariff,
            error,
        }
    }

    /// Install a batch of overrides. Stops at the first invalid entry;
    /// entries before it stay installed.
    pub fn load_tariffs(
        &self,
        tariffs: impl IntoIterator<Item = (String, TariffUpdate)>,
    ) -> Result<usize, Error> {
        let mut loaded = 0;
        for (api_key, update) in tariffs {
            self.set_tariff(&api_key, update)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Names accepted by [`Self::apply_tariff_plan_by_name`].
    pub fn plan_names() -> Vec<String> {
        TariffPlan::iter().map(|plan| plan.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_tariff() -> Tariff {
        Tariff {
            name: "Default".to_string(),
            max_tokens: 50_000,
            max_requests_per_window: 30,
            window_seconds: 60,
            description: "Default tariff".to_string(),
        }
    }

    #[test]
    fn test_unknown_keys_get_the_default_tariff() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();
        let tariff = registry.get_tariff("sk-unknown");
        assert_eq!(tariff.max_tokens, 50_000);
        assert_eq!(tariff.name, "Default");
        assert!(!registry.has_custom_tariff("sk-unknown"));
    }

    #[test]
    fn test_set_and_remove_tariff() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();

        let mut update = TariffUpdate::new(5_000);
        update.name = "Test Limited".to_string();
        let tariff = registry.set_tariff("sk-test-key-2", update).unwrap();
        assert_eq!(tariff.max_tokens, 5_000);
        // Rate limits are inherited from the default tariff.
        assert_eq!(tariff.max_requests_per_window, 30);
        assert_eq!(tariff.window_seconds, 60);
        assert_eq!(*registry.get_tariff("sk-test-key-2"), *tariff);

        assert!(registry.remove_tariff("sk-test-key-2"));
        assert!(!registry.remove_tariff("sk-test-key-2"));
        assert_eq!(registry.get_tariff("sk-test-key-2").max_tokens, 50_000);
    }

    #[test]
    fn test_set_tariff_rejects_non_positive_limits() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();

        let err = registry
            .set_tariff("sk-test-key-1", TariffUpdate::new(0))
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidTariff { .. }));

        let mut update = TariffUpdate::new(10);
        update.window_seconds = Some(0);
        assert!(registry.set_tariff("sk-test-key-1", update).is_err());
        assert!(!registry.has_custom_tariff("sk-test-key-1"));
    }

    #[test]
    fn test_plan_presets() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();

        let tariff = registry.apply_tariff_plan("k", TariffPlan::Premium).unwrap();
        assert_eq!(tariff.max_tokens, 100_000);
        assert_eq!(tariff.max_requests_per_window, 120);
        assert_eq!(tariff.name, "Premium");

        assert_eq!(TariffPlan::Basic.preset().max_tokens, 10_000);
        assert_eq!(TariffPlan::Enterprise.preset().max_tokens, 1_000_000);
        assert_eq!(TariffPlan::Unlimited.preset().max_tokens, 10_000_000);
        assert_eq!(
            TariffRegistry::plan_names(),
            vec!["basic", "premium", "enterprise", "unlimited"]
        );
    }

    #[test]
    fn test_plan_names_parse_case_insensitively() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();

        assert_eq!(TariffPlan::parse("ENTERPRISE").unwrap(), TariffPlan::Enterprise);
        let tariff = registry.apply_tariff_plan_by_name("k", "Basic").unwrap();
        assert_eq!(tariff.max_tokens, 10_000);

        let err = registry.apply_tariff_plan_by_name("k", "gold").unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::UnknownTariffPlan { .. }
        ));
        // The previous assignment is untouched.
        assert_eq!(registry.get_tariff("k").name, "Basic");
    }

    #[test]
    fn test_list_tariffs_masks_keys() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();
        registry
            .apply_tariff_plan("sk-prod-key-123", TariffPlan::Enterprise)
            .unwrap();
        registry
            .apply_tariff_plan("sk-demo-789", TariffPlan::Basic)
            .unwrap();

        let listed = registry.list_tariffs();
        let keys: Vec<&str> = listed.iter().map(|t| t.api_key.as_str()).collect();
        assert_eq!(keys, vec!["sk-demo-...", "sk-prod-..."]);
    }

    #[test]
    fn test_tariff_stats() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();
        registry.set_tariff("a", TariffUpdate::new(1_000)).unwrap();
        registry.set_tariff("b", TariffUpdate::new(2_000)).unwrap();
        registry.apply_tariff_plan("c", TariffPlan::Basic).unwrap();

        let stats = registry.tariff_stats();
        assert_eq!(stats.total_tariffs, 3);
        assert_eq!(stats.default_max_tokens, 50_000);
        assert_eq!(stats.total_max_tokens, 13_000);
        assert_eq!(
            stats.tariff_distribution["Custom"],
            TariffDistribution {
                count: 2,
                total_tokens: 3_000,
                avg_tokens: 1_500,
            }
        );
        assert_eq!(stats.tariff_distribution["Basic"].count, 1);
    }

    #[test]
    fn test_validate_api_key_tariff() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();
        registry.apply_tariff_plan("sk-test-key-1", TariffPlan::Basic).unwrap();

        let custom = registry.validate_api_key_tariff("sk-test-key-1");
        assert!(custom.valid);
        assert!(custom.has_custom_tariff);
        assert_eq!(custom.api_key, "sk-test-...");

        let default = registry.validate_api_key_tariff("sk-other-key");
        assert!(default.using_default);
        assert_eq!(default.error, None);
    }

    #[test]
    fn test_load_tariffs_and_update_deserialization() {
        let registry = TariffRegistry::new(default_tariff()).unwrap();
        let update: TariffUpdate = toml::from_str(
            r#"
            max_tokens = 1000
            name = "Test Minimal"
            "#,
        )
        .unwrap();
        assert_eq!(update.description, "Custom tariff");

        let loaded = registry
            .load_tariffs(vec![("sk-test-key-3".to_string(), update)])
            .unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(registry.get_tariff("sk-test-key-3").name, "Test Minimal");
    }

    #[test]
    fn test_invalid_default_tariff_is_rejected() {
        let mut tariff = default_tariff();
        tariff.max_requests_per_window = 0;
        assert!(TariffRegistry::new(tariff).is_err());

        let registry = TariffRegistry::new(default_tariff()).unwrap();
        let mut replacement = default_tariff();
        replacement.max_tokens = 80_000;
        registry.set_default_tariff(replacement).unwrap();
        assert_eq!(registry.get_tariff("anyone").max_tokens, 80_000);
    }
}
