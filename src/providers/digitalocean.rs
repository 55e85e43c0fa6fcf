use std::collections::BTreeSet;

use crate::providers::{
    CloudProvider, CloudResource, ProviderIdentity, ProviderPlan, ProviderStep,
};

const DIGITALOCEAN_ID: &str = "digitalocean";

/// DigitalOcean cloud provider. Planning is a pure diff of the desired
/// inventory against a `current` snapshot supplied by an external discovery
/// call; nothing here touches the network.
pub struct DigitalOceanCloud;

impl ProviderIdentity for DigitalOceanCloud {
    fn id(&self) -> &'static str {
        DIGITALOCEAN_ID
    }
}

impl CloudProvider for DigitalOceanCloud {
    fn plan_diff(&self, desired: &[CloudResource], current: &[CloudResource]) -> ProviderPlan {
        let desired_keys: BTreeSet<(&str, &str)> = desired
            .iter()
            .map(|r| (r.kind.as_str(), r.name.as_str()))
            .collect();
        let current_keys: BTreeSet<(&str, &str)> = current
            .iter()
            .map(|r| (r.kind.as_str(), r.name.as_str()))
            .collect();

        let mut steps = Vec::new();
        for (kind, name) in desired_keys.difference(&current_keys) {
            steps.push(ProviderStep::new(
                format!("create-{kind}-{name}"),
                format!("create {kind} {name}"),
            ));
        }
        for (kind, name) in desired_keys.intersection(&current_keys) {
            steps.push(ProviderStep::new(
                format!("keep-{kind}-{name}"),
                format!("keep {kind} {name}"),
            ));
        }
        for (kind, name) in current_keys.difference(&desired_keys) {
            steps.push(ProviderStep::new(
                format!("delete-{kind}-{name}"),
                format!("delete {kind} {name}"),
            ));
        }

        ProviderPlan {
            provider: DIGITALOCEAN_ID.to_string(),
            steps,
        }
    }
}
