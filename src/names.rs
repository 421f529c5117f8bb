use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// Outcome of resolving a brand name against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The brand string as the caller supplied it.
    pub brand: String,
    /// Provider prefix when the brand was `provider/rest`.
    pub provider: Option<String>,
    /// The model string the CLI actually understands.
    pub canonical: String,
    /// False when the brand was never registered and the canonical
    /// value is just the prefix-stripped input.
    pub registered: bool,
}

/// Maps vendor-qualified, aliased, or case-variant model names to the
/// canonical string a CLI accepts. Plain string lookups only: no regex,
/// no wildcards, so look-alike brand names can never collide.
#[derive(Debug, Default, Clone)]
pub struct NameRegistry {
    mappings: HashMap<String, String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `lower(brand) → canonical`, plus the provider-stripped key
    /// when it is not already taken. Later registrations win on the full
    /// key; the stripped key keeps its first owner.
    pub fn register(&mut self, brand: &str, canonical: &str) {
        let full = brand.to_lowercase();
        self.mappings.insert(full, canonical.to_string());

        let stripped = strip_provider(brand).to_lowercase();
        self.mappings
            .entry(stripped)
            .or_insert_with(|| canonical.to_string());
    }

    pub fn register_all<'a, I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (brand, canonical) in pairs {
            self.register(brand, canonical);
        }
    }

    /// Four-step lookup: full lowercase hit, then prefix-stripped hit,
    /// then fall through to the stripped input with `registered = false`.
    pub fn resolve(&self, brand: &str) -> Resolution {
        let provider = provider_of(brand).map(str::to_string);

        let full = brand.to_lowercase();
        if let Some(canonical) = self.mappings.get(&full) {
            return Resolution {
                brand: brand.to_string(),
                provider,
                canonical: canonical.clone(),
                registered: true,
            };
        }

        if brand.contains('/') {
            let rest = strip_provider(brand).to_lowercase();
            if let Some(canonical) = self.mappings.get(&rest) {
                return Resolution {
                    brand: brand.to_string(),
                    provider,
                    canonical: canonical.clone(),
                    registered: true,
                };
            }
        }

        Resolution {
            brand: brand.to_string(),
            provider,
            canonical: strip_provider(brand).to_string(),
            registered: false,
        }
    }

    pub fn has(&self, brand: &str) -> bool {
        self.mappings.contains_key(&brand.to_lowercase())
    }

    /// Snapshot of the stored mappings (lowercased brand → canonical).
    pub fn mappings(&self) -> HashMap<String, String> {
        self.mappings.clone()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// `provider/rest` → `rest`; unprefixed brands pass through.
fn strip_provider(brand: &str) -> &str {
    match brand.split_once('/') {
        Some((_, rest)) => rest,
        None => brand,
    }
}

fn provider_of(brand: &str) -> Option<&str> {
    brand.split_once('/').map(|(provider, _)| provider)
}

// ---------------------------------------------------------------------------
// Process-wide default registry
// ---------------------------------------------------------------------------

// Dependency injection is the primary interface; the default exists so a
// binary can register its config's aliases once at startup and resolve
// anywhere without threading the registry through every call site.
static DEFAULT_REGISTRY: LazyLock<Mutex<NameRegistry>> =
    LazyLock::new(|| Mutex::new(NameRegistry::new()));

pub fn register_default(brand: &str, canonical: &str) {
    DEFAULT_REGISTRY
        .lock()
        .expect("name registry lock poisoned")
        .register(brand, canonical);
}

pub fn resolve_default(brand: &str) -> Resolution {
    DEFAULT_REGISTRY
        .lock()
        .expect("name registry lock poisoned")
        .resolve(brand)
}

/// Drop all default-registry mappings. Test affordance.
pub fn reset_default() {
    DEFAULT_REGISTRY
        .lock()
        .expect("name registry lock poisoned")
        .mappings
        .clear();
}
