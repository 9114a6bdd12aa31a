//! Firewall rules blocking IP ranges of whole countries.
//!
//! The helper downloads the range list from the URL it is given and
//! creates (or deletes) the rule; nothing here touches the network.

use serde::{Deserialize, Serialize};

use crate::engine::{
    Category, CategorySource, DefaultApply, DefaultRemove, DeviceIntent, EngineResult,
    HostServices, PolicyUnit, Unverifiable,
};

const LIST_BASE: &str =
    "https://raw.githubusercontent.com/HotCakeX/Official-IANA-IP-blocks/main/Curated-Lists";

/// A country (or curated group) with its IP range lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryList {
    pub name: String,
    pub ipv4_url: String,
    #[serde(default)]
    pub ipv6_url: Option<String>,
}

/// `firewall "<rule>" <url> true|false`
pub fn firewall_command(rule: &str, url: &str, create: bool) -> String {
    format!("firewall \"{}\" {} {}", rule, url, create)
}

struct Rule {
    name: String,
    url: String,
}

fn curated_rules() -> Vec<(String, Vec<Rule>, &'static str)> {
    vec![
        (
            "Block State Sponsors of Terrorism".to_string(),
            vec![Rule {
                name: "State Sponsors of Terrorism IP range blocking".to_string(),
                url: format!("{}/StateSponsorsOfTerrorism.txt", LIST_BASE),
            }],
            "https://www.state.gov/state-sponsors-of-terrorism/",
        ),
        (
            "Block OFAC sanctioned countries".to_string(),
            vec![Rule {
                name: "OFAC Sanctioned Countries IP range blocking".to_string(),
                url: format!("{}/OFACSanctioned.txt", LIST_BASE),
            }],
            "https://ofac.treasury.gov/sanctions-programs-and-country-information",
        ),
    ]
}

fn country_rules(country: &CountryList) -> Vec<Rule> {
    let mut rules = vec![Rule {
        name: format!("{} IPv4 IP range blocking", country.name),
        url: country.ipv4_url.clone(),
    }];
    if let Some(v6) = &country.ipv6_url {
        rules.push(Rule {
            name: format!("{} IPv6 IP range blocking", country.name),
            url: v6.clone(),
        });
    }
    rules
}

fn rules_unit(host: &HostServices, name: String, rules: Vec<Rule>, url: Option<&str>) -> PolicyUnit {
    let create: Vec<String> = rules
        .iter()
        .map(|r| firewall_command(&r.name, &r.url, true))
        .collect();
    let delete: Vec<String> = rules
        .iter()
        .map(|r| firewall_command(&r.name, &r.url, false))
        .collect();
    let (a, r) = (host.clone(), host.clone());

    let mut builder = PolicyUnit::builder(Category::CountryIpBlocking, name)
        .intents([DeviceIntent::All])
        .apply(DefaultApply::new(move || {
            for command in &create {
                a.helper(command)?;
            }
            Ok(())
        }))
        // Rule state lives in the firewall store, which the helper does not report on
        .verify(Unverifiable)
        .remove(DefaultRemove::new(move || {
            for command in &delete {
                r.helper(command)?;
            }
            Ok(())
        }));
    if let Some(url) = url {
        builder = builder.url(url);
    }
    builder.build()
}

/// Curated lists plus one unit per configured country.
pub struct CountryIpBlocking {
    countries: Vec<CountryList>,
}

impl CountryIpBlocking {
    pub fn new(countries: Vec<CountryList>) -> Self {
        Self { countries }
    }
}

impl CategorySource for CountryIpBlocking {
    fn category(&self) -> Category {
        Category::CountryIpBlocking
    }

    fn hand_authored(&self, host: &HostServices) -> EngineResult<Vec<PolicyUnit>> {
        let mut units: Vec<PolicyUnit> = curated_rules()
            .into_iter()
            .map(|(name, rules, url)| rules_unit(host, name, rules, Some(url)))
            .collect();
        units.extend(self.countries.iter().map(|country| {
            rules_unit(
                host,
                format!("Block {}", country.name),
                country_rules(country),
                None,
            )
        }));
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ComplianceStatus, DefinitionLoader, EngineContext, EngineError, InMemoryAccessor,
        ScriptedCommandChannel, scripted_host,
    };
    use std::sync::Arc;

    fn context(commands: Arc<ScriptedCommandChannel>, countries: Vec<CountryList>) -> EngineContext {
        EngineContext::new(
            scripted_host(Arc::new(InMemoryAccessor::new()), commands),
            DefinitionLoader::bundled(),
        )
        .with_source(Arc::new(CountryIpBlocking::new(countries)))
    }

    #[test]
    fn curated_list_commands() {
        let commands = Arc::new(ScriptedCommandChannel::new());
        let ctx = context(commands.clone(), Vec::new());
        let unit = ctx.lookup("Block State Sponsors of Terrorism").unwrap();

        ctx.apply_unit(&unit).unwrap();
        ctx.remove_unit(&unit).unwrap();
        assert_eq!(
            commands.calls(),
            vec![
                "firewall \"State Sponsors of Terrorism IP range blocking\" https://raw.githubusercontent.com/HotCakeX/Official-IANA-IP-blocks/main/Curated-Lists/StateSponsorsOfTerrorism.txt true",
                "firewall \"State Sponsors of Terrorism IP range blocking\" https://raw.githubusercontent.com/HotCakeX/Official-IANA-IP-blocks/main/Curated-Lists/StateSponsorsOfTerrorism.txt false",
            ]
        );
    }

    #[test]
    fn configured_country_gets_both_families() {
        let commands = Arc::new(ScriptedCommandChannel::new());
        let ctx = context(
            commands.clone(),
            vec![CountryList {
                name: "Atlantis".into(),
                ipv4_url: "https://lists.example/atlantis-v4.txt".into(),
                ipv6_url: Some("https://lists.example/atlantis-v6.txt".into()),
            }],
        );
        let unit = ctx.lookup("Block Atlantis").unwrap();
        ctx.apply_unit(&unit).unwrap();

        let calls = commands.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("firewall \"Atlantis IPv4 IP range blocking\""));
        assert!(calls[1].ends_with("atlantis-v6.txt true"));
    }

    #[test]
    fn rules_cannot_be_verified() {
        let ctx = context(Arc::new(ScriptedCommandChannel::new()), Vec::new());
        let unit = ctx.lookup("Block OFAC sanctioned countries").unwrap();
        let outcome = ctx.verify_unit(&unit);
        assert_eq!(outcome.status, ComplianceStatus::Undetermined);
        assert!(matches!(outcome.error, Some(EngineError::Indeterminate(_))));
    }
}
