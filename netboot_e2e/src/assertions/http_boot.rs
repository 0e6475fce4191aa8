// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::AssertionValidator;
use super::EvidenceSource;
use super::Finding;
use super::Poller;
use super::ValidationError;
use super::fields::BOOT_REQUEST;
use super::fields::parse_lines;
use crate::CancelContext;
use crate::vm::VmInstance;
use async_trait::async_trait;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::AssertionSpec;
use netboot_e2e_defs::InfrastructureState;
use std::sync::Arc;
use std::time::Duration;

/// Checks that a VM's iPXE firmware reached the provisioning API.
///
/// Looks for an `ipxe_boot_request` event carrying the VM's UUID. If the
/// assertion names an expected value, such as a boot script path, the request
/// line must also contain it.
#[derive(Debug, Clone)]
pub struct HttpBootValidator {
    poller: Poller,
}

impl HttpBootValidator {
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

fn check_requests(text: &str, uuid: &str, expected: Option<&str>) -> Option<Finding> {
    parse_lines(text)
        .iter()
        .filter(|line| line.is_event(BOOT_REQUEST) && line.is_for(uuid))
        .find(|line| expected.is_none_or(|e| line.raw().contains(e)))
        .map(|line| {
            let seen = line.uuid().unwrap_or(uuid);
            Finding::pass(seen, format!("boot request from {seen}"))
        })
}

#[async_trait]
impl AssertionValidator for HttpBootValidator {
    async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        _infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult> {
        let Some(uuid) = vm.uuid() else {
            return Err(ValidationError::UuidUnknown {
                vm: vm.name().to_owned(),
            }
            .into());
        };
        let expected = assertion.expected.as_deref().filter(|e| !e.is_empty());
        let waiting_for = format!("an {BOOT_REQUEST} from {uuid}");
        self.poller
            .poll(ctx, assertion, vm, &waiting_for, |text| {
                check_requests(text, uuid, expected)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::StaticSource;
    use crate::assertions::tests::VM_UUID;
    use crate::assertions::tests::deadline;
    use crate::assertions::tests::infra;
    use crate::assertions::tests::vm;
    use crate::vm::VmMetadata;
    use netboot_e2e_defs::AssertionKind;
    use netboot_e2e_defs::VmSpec;

    #[test]
    fn both_encodings_match() {
        let structured = r#"{"level":"info","msg":"ipxe_boot_request","uuid":"AbC","path":"/boot.ipxe"}"#;
        let flat = "level=info msg=ipxe_boot_request uuid=abc path=/boot.ipxe";
        for text in [structured, flat] {
            let finding = check_requests(text, "ABC", None).unwrap();
            assert!(finding.passed);
            assert!(finding.actual.eq_ignore_ascii_case("abc"));
        }
    }

    #[test]
    fn other_uuid_does_not_match() {
        assert!(check_requests("msg=ipxe_boot_request uuid=other", "abc", None).is_none());
        assert!(check_requests("msg=ipxe_boot_request", "abc", None).is_none());
    }

    #[test]
    fn expected_value_must_appear() {
        let text = "msg=ipxe_boot_request uuid=abc path=/boot.ipxe\n";
        assert!(check_requests(text, "abc", Some("/grub.cfg")).is_none());
        assert!(check_requests(text, "abc", Some("/boot.ipxe")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn uses_manager_assigned_uuid() {
        let text = format!("msg=ipxe_boot_request uuid={VM_UUID}\n");
        let validator = HttpBootValidator::new(Arc::new(StaticSource::new(text)));
        let vm = VmInstance {
            spec: VmSpec::new("test-vm-1"),
            metadata: VmMetadata {
                uuid: Some(VM_UUID.into()),
                ..Default::default()
            },
            ..vm()
        };
        let assertion = AssertionSpec::new("test-vm-1", AssertionKind::HttpBoot);
        let result = validator
            .validate(&deadline(10), &assertion, &vm, &infra())
            .await
            .unwrap();
        assert!(result.passed, "{result:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn no_uuid_is_an_error() {
        let validator = HttpBootValidator::new(Arc::new(StaticSource::default()));
        let vm = VmInstance {
            spec: VmSpec::new("test-vm-1"),
            ..vm()
        };
        let assertion = AssertionSpec::new("test-vm-1", AssertionKind::HttpBoot);
        let err = validator
            .validate(&deadline(10), &assertion, &vm, &infra())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::UuidUnknown { .. })
        ));
    }
}
