//! In-memory registry of per-variant agents.
//!
//! Every registration renders a fresh self-contained agent and stores it under
//! an opaque key derived from the experiment, the variant, the target URL and
//! the registration time. Registering the same variant twice yields two
//! independent entries; nothing expires on its own.

use crate::agent::{AgentCodeGenerator, GenerateOptions};
use crate::clock::{Clock, SystemClock};
use crate::extractor::check_url;
use crate::model::Variant;
use crate::Result;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A stored agent and the registration it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredVariant {
    pub key: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub target_url: String,
    pub script: String,
    /// Milliseconds since the clock's epoch
    pub created_at: u64,
}

pub struct VariantRegistry {
    generator: AgentCodeGenerator,
    options: GenerateOptions,
    clock: Arc<dyn Clock>,
    max_url_len: usize,
    seq: AtomicU64,
    entries: Mutex<HashMap<String, RegisteredVariant>>,
}

impl VariantRegistry {
    pub fn new(generator: AgentCodeGenerator) -> Self {
        Self::with_clock(generator, Arc::new(SystemClock))
    }

    pub fn with_clock(generator: AgentCodeGenerator, clock: Arc<dyn Clock>) -> Self {
        Self {
            generator,
            options: GenerateOptions::default(),
            clock,
            max_url_len: 2048,
            seq: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Options used for every agent rendered by this registry.
    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// Longest accepted target URL.
    pub fn with_max_url_len(mut self, max_url_len: usize) -> Self {
        self.max_url_len = max_url_len;
        self
    }

    pub fn generator(&self) -> &AgentCodeGenerator {
        &self.generator
    }

    /// Render and store an agent for `variant`; returns the new key.
    pub fn register(&self, experiment_id: &str, variant: &Variant, target_url: &str) -> Result<String> {
        if experiment_id.trim().is_empty() {
            return Err(crate::Error::Validation("experimentId is required".into()));
        }
        variant.validate()?;
        check_url(target_url, self.max_url_len)?;
        let target_url = target_url.trim();

        let created_at = self.clock.now_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = derive_key(experiment_id, &variant.id, target_url, created_at, seq);
        let script = self
            .generator
            .generate_for_variant(experiment_id, variant, target_url, &self.options);

        let entry = RegisteredVariant {
            key: key.clone(),
            experiment_id: experiment_id.to_string(),
            variant_id: variant.id.clone(),
            target_url: target_url.to_string(),
            script,
            created_at,
        };
        self.lock().insert(key.clone(), entry);
        debug!(
            "registered variant {} of experiment {} as {}",
            variant.id, experiment_id, key
        );
        Ok(key)
    }

    pub fn lookup(&self, key: &str) -> Option<RegisteredVariant> {
        self.lock().get(key).cloned()
    }

    pub fn evict(&self, key: &str) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            debug!("evicted registered variant {}", key);
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegisteredVariant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn derive_key(experiment_id: &str, variant_id: &str, target_url: &str, millis: u64, seq: u64) -> String {
    let mut hasher = Sha256::new();
    for part in [experiment_id, variant_id, target_url] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(millis.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(seq.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{ElementSelection, Status, StyleMap};
    use std::time::Duration;

    fn variant(is_control: bool) -> Variant {
        let mut styles = StyleMap::new();
        if !is_control {
            styles.insert("color".into(), "red".into());
        }
        Variant {
            id: "V1".into(),
            name: "Variant".into(),
            is_control,
            elements: vec![ElementSelection {
                id: "h1".into(),
                selector: Some("h1".into()),
                original_styles: StyleMap::new(),
                variant_styles: styles,
            }],
            traffic: 50.0,
            status: Status::Draft,
        }
    }

    fn registry() -> (VariantRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
        (
            VariantRegistry::with_clock(AgentCodeGenerator::default(), clock.clone()),
            clock,
        )
    }

    #[test]
    fn register_then_lookup() {
        let (reg, clock) = registry();
        let key = reg.register("E1", &variant(false), "https://shop.test/").unwrap();
        assert_eq!(key.len(), 32);
        let entry = reg.lookup(&key).unwrap();
        assert_eq!(entry.experiment_id, "E1");
        assert_eq!(entry.variant_id, "V1");
        assert_eq!(entry.created_at, clock.now_millis());
        assert!(entry.script.contains("\"targetUrl\":\"https://shop.test/\""));
    }

    #[test]
    fn repeated_registration_yields_distinct_keys() {
        let (reg, clock) = registry();
        let a = reg.register("E1", &variant(false), "https://shop.test/").unwrap();
        let b = reg.register("E1", &variant(false), "https://shop.test/").unwrap();
        clock.advance(Duration::from_millis(5));
        let c = reg.register("E1", &variant(false), "https://shop.test/").unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(reg.len(), 3);
        // identical inputs render identical scripts
        assert_eq!(reg.lookup(&a).unwrap().script, reg.lookup(&b).unwrap().script);
    }

    #[test]
    fn evict_and_clear() {
        let (reg, _clock) = registry();
        let key = reg.register("E1", &variant(false), "https://shop.test/").unwrap();
        reg.register("E1", &variant(false), "https://shop.test/").unwrap();
        assert!(!reg.evict("missing"));
        assert_eq!(reg.len(), 2);
        assert!(reg.evict(&key));
        assert!(reg.lookup(&key).is_none());
        reg.clear();
        assert!(reg.is_empty());
    }

    #[test]
    fn invalid_registrations_are_rejected() {
        let (reg, _clock) = registry();
        let mut bad = variant(false);
        bad.traffic = 120.0;
        assert!(matches!(
            reg.register("E1", &bad, "https://shop.test/"),
            Err(crate::Error::Validation(_))
        ));
        assert!(reg.register(" ", &variant(false), "https://shop.test/").is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn target_url_must_be_absolute_http() {
        let (reg, _clock) = registry();
        let long = format!("https://shop.test/{}", "a".repeat(5000));
        for target in ["", "  ", "not a url", "/landing", "ftp://shop.test/", long.as_str()] {
            assert!(
                matches!(
                    reg.register("E1", &variant(false), target),
                    Err(crate::Error::Validation(_))
                ),
                "accepted {:?}",
                target
            );
        }
        assert!(reg.is_empty());

        let short = VariantRegistry::new(AgentCodeGenerator::default()).with_max_url_len(20);
        assert!(short.register("E1", &variant(false), "https://shop.test/landing").is_err());
        assert!(short.register("E1", &variant(false), "https://shop.test/").is_ok());
    }
}
