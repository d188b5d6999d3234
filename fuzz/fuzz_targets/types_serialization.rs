#![no_main]

use circuit_types::{Artifact, Deployment, Job};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Try to parse as JSON and verify serialization roundtrips
    if let Ok(json_str) = std::str::from_utf8(data) {
        // Deployment roundtrip
        if let Ok(deployment) = serde_json::from_str::<Deployment>(json_str) {
            if let Ok(roundtripped) = serde_json::to_string(&deployment) {
                if let Ok(parsed) = serde_json::from_str::<Deployment>(&roundtripped) {
                    assert_eq!(deployment.deployment_id, parsed.deployment_id);
                    assert_eq!(deployment.status, parsed.status);
                }
            }
        }

        // Job roundtrip; invariants_hold must agree before and after.
        if let Ok(job) = serde_json::from_str::<Job>(json_str) {
            if let Ok(roundtripped) = serde_json::to_string(&job) {
                if let Ok(parsed) = serde_json::from_str::<Job>(&roundtripped) {
                    assert_eq!(job.job_id, parsed.job_id);
                    assert_eq!(job.retry_count, parsed.retry_count);
                    assert_eq!(job.invariants_hold(), parsed.invariants_hold());
                }
            }
        }

        // Artifact roundtrip
        if let Ok(artifact) = serde_json::from_str::<Artifact>(json_str) {
            if let Ok(roundtripped) = serde_json::to_string(&artifact) {
                if let Ok(parsed) = serde_json::from_str::<Artifact>(&roundtripped) {
                    assert_eq!(artifact.artifact_id, parsed.artifact_id);
                    assert_eq!(artifact.job_id, parsed.job_id);
                }
            }
        }
    }
});