//! Category-specific units and registrations.
//!
//! Most units come straight from the bundled definition files. The sources
//! here add what a definition cannot express: multi-value sequencing,
//! helper-driven settings, verification overrides and dependencies.

pub mod country_blocking;
pub mod defender;
pub mod firewall;
pub mod lockout;
pub mod misc;
pub mod tls;

use std::sync::Arc;

use crate::engine::CategorySource;

pub use country_blocking::{CountryIpBlocking, CountryList};
pub use defender::MicrosoftDefender;
pub use firewall::WindowsFirewall;
pub use lockout::LockoutPolicies;
pub use misc::MiscellaneousConfigurations;
pub use tls::TlsSecurity;

/// Every built-in source. `countries` adds one blocking unit per entry on
/// top of the curated lists.
pub fn builtin_sources(countries: Vec<CountryList>) -> Vec<Arc<dyn CategorySource>> {
    vec![
        Arc::new(LockoutPolicies),
        Arc::new(MicrosoftDefender),
        Arc::new(TlsSecurity),
        Arc::new(WindowsFirewall),
        Arc::new(MiscellaneousConfigurations),
        Arc::new(CountryIpBlocking::new(countries)),
    ]
}
