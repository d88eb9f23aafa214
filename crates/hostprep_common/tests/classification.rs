//! Every failure maps to a category with guidance and an exit code

use hostprep_common::classifier::{classify, ErrorCategory};
use hostprep_common::exit_codes::{self, for_category};
use hostprep_common::release::HostArch;
use hostprep_common::{advisory, FailureReason, StepId};

fn every_reason() -> Vec<FailureReason> {
    vec![
        FailureReason::UnsupportedArchitecture {
            arch: HostArch::Arm64,
        },
        FailureReason::OsBuildTooOld {
            build: 17763,
            minimum: 19041,
        },
        FailureReason::FeatureQueryFailed {
            feature: "VirtualMachinePlatform".to_string(),
        },
        FailureReason::FeatureEnableFailed {
            feature: "VirtualMachinePlatform".to_string(),
            exit_code: Some(50),
        },
        FailureReason::SubsystemOutdated {
            current: "2.0.0".to_string(),
            latest: "2.1.5".to_string(),
        },
        FailureReason::SubsystemInstallFailed {
            exit_code: Some(1603),
        },
        FailureReason::SubsystemStatusUnknown,
        FailureReason::DefaultModeFailed { exit_code: None },
        FailureReason::CompanionRunning {
            process: "Companion.exe".to_string(),
            count: 2,
        },
        FailureReason::ImageInstallFailed { exit_code: Some(1) },
        FailureReason::ImageUnregisterFailed { exit_code: None },
        FailureReason::ImageVersionUnknown,
        FailureReason::Timeout {
            program: "wsl.exe".to_string(),
        },
        FailureReason::OsQueryFailed,
        FailureReason::SubsystemNotInstalled,
        FailureReason::ProcessQueryFailed,
        FailureReason::ImageSetupFailed,
        FailureReason::ReleaseUnavailable,
        FailureReason::AssetNotFound,
        FailureReason::DownloadFailed,
        FailureReason::VerificationFailed,
        FailureReason::PermissionDenied,
    ]
}

#[test]
fn every_reason_in_every_step_has_guidance() {
    for step in StepId::ALL {
        for reason in every_reason() {
            let category = classify(step, Some(&reason), "");
            let advice = advisory(category);
            assert!(!advice.title.is_empty(), "{:?}", category);
            assert!(!advice.steps.is_empty(), "{:?}", category);

            let code = for_category(category, step);
            assert!(
                (exit_codes::EXIT_UNEXPECTED..=exit_codes::EXIT_ABORTED).contains(&code),
                "{:?} in {} gave {}",
                category,
                step,
                code
            );
        }
    }
}

#[test]
fn free_text_always_lands_somewhere() {
    let messages = [
        "",
        "The operation timed out after 300s",
        "Access is denied.",
        "error sending request: dns error: failed to lookup address",
        "sha256 mismatch: expected ab12, got cd34",
        "something nobody anticipated",
    ];
    for step in StepId::ALL {
        for message in messages {
            let category = classify(step, None, message);
            assert!(ErrorCategory::ALL.contains(&category));
        }
    }
}

#[test]
fn categories_parse_from_their_names() {
    for category in ErrorCategory::ALL {
        assert_eq!(ErrorCategory::parse(category.as_str()), Some(category));
        assert!(!advisory(category).description.is_empty());
    }
    assert_eq!(ErrorCategory::parse("no-such-category"), None);
}
