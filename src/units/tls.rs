use std::sync::Arc;

use crate::engine::{
    BuildScope, Category, CategorySource, CipherSuiteSource, EngineError, EngineResult,
    PolicyKey, PolicyValue, SpecializedVerification,
};

pub const CIPHER_SUITE_PATH: &str =
    "Software\\Policies\\Microsoft\\Cryptography\\Configuration\\SSL\\00010002";

pub fn cipher_suite_key() -> PolicyKey {
    PolicyKey::new(CIPHER_SUITE_PATH, "Functions")
}

/// Compares the configured cipher-suite order with what the TLS stack
/// actually offers. The group policy value can be in place while the
/// stack still negotiates something else, so the live list wins.
pub struct CipherSuiteVerification {
    source: Arc<dyn CipherSuiteSource>,
}

impl CipherSuiteVerification {
    pub fn new(source: Arc<dyn CipherSuiteSource>) -> Self {
        Self { source }
    }
}

impl SpecializedVerification for CipherSuiteVerification {
    fn verify(&self, target: Option<&PolicyValue>) -> EngineResult<bool> {
        let expected = target
            .map(PolicyValue::as_list)
            .filter(|list| !list.is_empty())
            .ok_or_else(|| EngineError::indeterminate("no configured cipher-suite list"))?;
        let live = self.source.enumerate()?;

        Ok(live.len() == expected.len()
            && live
                .iter()
                .zip(&expected)
                .all(|(a, b)| a.trim().eq_ignore_ascii_case(b.trim())))
    }
}

pub struct TlsSecurity;

impl CategorySource for TlsSecurity {
    fn category(&self) -> Category {
        Category::TlsSecurity
    }

    fn register(&self, scope: &BuildScope<'_>) -> EngineResult<()> {
        scope.specialized.register_verification(
            cipher_suite_key(),
            Arc::new(CipherSuiteVerification::new(scope.host.cipher_suites.clone())),
        );
        Ok(())
    }
}
