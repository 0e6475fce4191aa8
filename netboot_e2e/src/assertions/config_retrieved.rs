// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::AssertionValidator;
use super::EvidenceSource;
use super::Finding;
use super::Poller;
use super::fields::CONFIG_RETRIEVED;
use super::fields::parse_lines;
use crate::CancelContext;
use crate::vm::VmInstance;
use async_trait::async_trait;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::AssertionSpec;
use netboot_e2e_defs::InfrastructureState;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_FIELDS: &[&str] = &["config", "name"];

/// Checks that a VM retrieved its rendered configuration.
///
/// Without an expected value, any `config_retrieved` event passes. With one,
/// the event must name that config. Events tagged with another machine's UUID
/// are ignored.
#[derive(Debug, Clone)]
pub struct ConfigRetrievedValidator {
    poller: Poller,
}

impl ConfigRetrievedValidator {
    /// Reads the API's log from `source`.
    pub fn new(source: Arc<dyn EvidenceSource>) -> Self {
        Self {
            poller: Poller::new(source),
        }
    }

    /// Sets how often the log is re-read.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller.interval = interval;
        self
    }
}

fn check_retrievals(text: &str, uuid: Option<&str>, expected: Option<&str>) -> Option<Finding> {
    parse_lines(text)
        .iter()
        .filter(|line| line.is_event(CONFIG_RETRIEVED))
        .filter(|line| uuid.is_none_or(|uuid| !line.is_for_other(uuid)))
        .find_map(|line| {
            let config = line.first_field(CONFIG_FIELDS).unwrap_or_default();
            match expected {
                None => Some(Finding::pass(config, "config retrieved")),
                Some(expected) if config == expected => {
                    Some(Finding::pass(config, format!("config {config:?} retrieved")))
                }
                Some(_) => None,
            }
        })
}

#[async_trait]
impl AssertionValidator for ConfigRetrievedValidator {
    async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        _infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult> {
        let uuid = vm.uuid();
        let expected = assertion.expected.as_deref().filter(|e| !e.is_empty());
        let waiting_for = match expected {
            Some(config) => format!("{CONFIG_RETRIEVED} of {config:?}"),
            None => CONFIG_RETRIEVED.to_owned(),
        };
        self.poller
            .poll(ctx, assertion, vm, &waiting_for, |text| {
                check_retrievals(text, uuid, expected)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::StaticSource;
    use crate::assertions::tests::deadline;
    use crate::assertions::tests::infra;
    use crate::assertions::tests::vm;
    use netboot_e2e_defs::AssertionKind;

    #[test]
    fn no_expectation_is_a_wildcard() {
        let finding = check_retrievals("INFO config_retrieved\n", Some("u1"), None).unwrap();
        assert!(finding.passed);
        assert_eq!(finding.actual, "");
    }

    #[test]
    fn expected_config_must_match() {
        let text = "\
msg=config_retrieved uuid=u1 config=controller.ign
msg=config_retrieved uuid=u2 config=worker.ign
msg=config_retrieved uuid=u1 config=worker.ign
";
        let finding = check_retrievals(text, Some("u1"), Some("worker.ign")).unwrap();
        assert_eq!(finding.actual, "worker.ign");
        assert!(check_retrievals(text, Some("u1"), Some("gpu.ign")).is_none());
        assert!(check_retrievals(text, Some("u3"), None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn validates_against_log() {
        let text = r#"{"msg":"config_retrieved","uuid":"11111111-2222-3333-4444-555555555555","name":"cloud-init"}"#;
        let validator = ConfigRetrievedValidator::new(Arc::new(StaticSource::new(text)));
        let assertion = AssertionSpec::new("test-vm-1", AssertionKind::ConfigRetrieved)
            .with_expected("cloud-init");
        let result = validator
            .validate(&deadline(10), &assertion, &vm(), &infra())
            .await
            .unwrap();
        assert!(result.passed, "{result:?}");
        assert_eq!(result.actual, "cloud-init");
    }
}
