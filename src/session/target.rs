//! Upload targets from an `ApplyUploadInfo` response

use crate::control::{ApplyUploadInfoResponse, UploadAddress};
use crate::upload::{StorageClass, UploadError, UploadOutcome, UploadTarget};

fn check_service_error(resp: &ApplyUploadInfoResponse) -> Result<(), UploadError> {
    match resp.response_metadata.service_error() {
        Some(error) => Err(UploadError::NoUploadAddress(format!(
            "apply upload info failed: {} {}",
            error.code, error.message
        ))),
        None => Ok(()),
    }
}

/// Target for one address, or `None` when it lacks hosts or store info.
fn target_from_address(
    address: &UploadAddress,
    space_name: &str,
    storage_class: StorageClass,
) -> Option<UploadTarget> {
    let store = address.store_info()?;
    if address.upload_hosts.is_empty() {
        return None;
    }
    Some(UploadTarget {
        space_name: space_name.to_string(),
        hosts: address.upload_hosts.clone(),
        object_id: store.store_uri.clone(),
        session_key: address.session_key.clone(),
        auth_token: store.auth.clone(),
        storage_class,
        preferred_host_index: 0,
    })
}

/// Single target for callers that drive the low-level primitives.
///
/// Object id, auth and session key come from the `UploadAddress`. When
/// candidate addresses exist, their hosts (main, backup, fallback) replace
/// its host list.
pub fn build_upload_target(
    resp: &ApplyUploadInfoResponse,
    space_name: &str,
    storage_class: StorageClass,
) -> Result<UploadTarget, UploadError> {
    check_service_error(resp)?;

    let data = resp.data();
    let address = data
        .upload_address
        .as_ref()
        .ok_or_else(|| UploadError::NoUploadAddress("upload address not exist".into()))?;
    if address.upload_hosts.is_empty() {
        return Err(UploadError::NoUploadAddress("no upload host found".into()));
    }
    let mut target = target_from_address(address, space_name, storage_class)
        .ok_or_else(|| UploadError::NoUploadAddress("no store info found".into()))?;

    if let Some(candidates) = &data.candidate_upload_addresses {
        let hosts: Vec<String> = candidates
            .in_priority_order()
            .flat_map(|a| a.upload_hosts.iter().cloned())
            .collect();
        if !hosts.is_empty() {
            target.hosts = hosts;
        }
    }

    Ok(target)
}

/// One target per usable candidate address, in failover order.
///
/// Falls back to the single `UploadAddress` when no candidate is usable.
pub fn candidate_targets(
    resp: &ApplyUploadInfoResponse,
    space_name: &str,
    storage_class: StorageClass,
) -> Result<Vec<UploadTarget>, UploadError> {
    check_service_error(resp)?;

    let data = resp.data();
    let targets: Vec<UploadTarget> = data
        .candidate_upload_addresses
        .iter()
        .flat_map(|c| c.in_priority_order())
        .filter_map(|a| target_from_address(a, space_name, storage_class))
        .collect();
    if !targets.is_empty() {
        return Ok(targets);
    }

    let address = data
        .upload_address
        .as_ref()
        .ok_or_else(|| UploadError::NoUploadAddress("upload address not exist".into()))?;
    if address.upload_hosts.is_empty() {
        return Err(UploadError::NoUploadAddress("no upload host found".into()));
    }
    target_from_address(address, space_name, storage_class)
        .map(|t| vec![t])
        .ok_or_else(|| UploadError::NoUploadAddress("no store info found".into()))
}

/// Object id and session key of a VPC upload, taken from the
/// `UploadAddress` that accompanies the pre-signed URLs.
pub(crate) fn vpc_outcome(resp: &ApplyUploadInfoResponse) -> Result<UploadOutcome, UploadError> {
    let address = resp
        .data()
        .upload_address
        .as_ref()
        .ok_or_else(|| UploadError::NoUploadAddress("upload address not exist".into()))?;
    let store = address
        .store_info()
        .ok_or_else(|| UploadError::NoUploadAddress("no store info found".into()))?;
    Ok(UploadOutcome {
        object_id: store.store_uri.clone(),
        session_key: address.session_key.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{
        ApplyUploadInfoData, ApplyUploadInfoResult, CandidateUploadAddresses, ResponseError,
        StoreInfo,
    };

    fn address(host: &str, oid: &str) -> UploadAddress {
        UploadAddress {
            store_infos: vec![StoreInfo {
                store_uri: oid.into(),
                auth: format!("auth-{}", oid),
            }],
            upload_hosts: vec![host.into()],
            session_key: format!("sk-{}", oid),
        }
    }

    fn response(
        upload_address: Option<UploadAddress>,
        candidates: Option<CandidateUploadAddresses>,
    ) -> ApplyUploadInfoResponse {
        ApplyUploadInfoResponse {
            result: ApplyUploadInfoResult {
                data: ApplyUploadInfoData {
                    upload_address,
                    candidate_upload_addresses: candidates,
                    vpc_upload_address: None,
                },
            },
            ..Default::default()
        }
    }

    fn candidates() -> CandidateUploadAddresses {
        CandidateUploadAddresses {
            main_upload_addresses: vec![address("h1", "o1")],
            backup_upload_addresses: vec![
                UploadAddress {
                    upload_hosts: vec![],
                    ..address("skipped", "o-skip")
                },
                address("h2", "o2"),
            ],
            fallback_upload_addresses: vec![address("h3", "o3")],
        }
    }

    #[test]
    fn test_build_target_uses_candidate_hosts() {
        let resp = response(Some(address("h0", "o0")), Some(candidates()));
        let target = build_upload_target(&resp, "space", StorageClass::Archive).unwrap();
        assert_eq!(target.object_id, "o0");
        assert_eq!(target.session_key, "sk-o0");
        assert_eq!(target.hosts, vec!["h1", "h2", "h3"]);
        assert_eq!(target.storage_class, StorageClass::Archive);
    }

    #[test]
    fn test_build_target_requires_upload_address() {
        let resp = response(None, Some(candidates()));
        assert!(matches!(
            build_upload_target(&resp, "space", StorageClass::Standard),
            Err(UploadError::NoUploadAddress(_))
        ));

        let no_store = UploadAddress {
            store_infos: vec![],
            ..address("h0", "o0")
        };
        assert!(build_upload_target(&response(Some(no_store), None), "s", StorageClass::Standard)
            .is_err());
    }

    #[test]
    fn test_candidate_targets_in_priority_order() {
        let resp = response(Some(address("h0", "o0")), Some(candidates()));
        let targets = candidate_targets(&resp, "space", StorageClass::Standard).unwrap();
        let hosts: Vec<_> = targets.iter().map(|t| t.host()).collect();
        assert_eq!(hosts, vec!["h1", "h2", "h3"]);
        assert_eq!(targets[1].session_key, "sk-o2");
    }

    #[test]
    fn test_candidate_targets_fall_back_to_upload_address() {
        let resp = response(Some(address("h0", "o0")), None);
        let targets = candidate_targets(&resp, "space", StorageClass::Standard).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host(), "h0");

        assert!(candidate_targets(&response(None, None), "space", StorageClass::Standard).is_err());
    }

    #[test]
    fn test_service_error_rejected() {
        let mut resp = response(Some(address("h0", "o0")), None);
        resp.response_metadata.error = Some(ResponseError {
            code: "InvalidSpace".into(),
            message: "no such space".into(),
        });
        assert!(build_upload_target(&resp, "space", StorageClass::Standard).is_err());
        assert!(candidate_targets(&resp, "space", StorageClass::Standard).is_err());
    }

    #[test]
    fn test_vpc_outcome_from_upload_address() {
        let resp = response(Some(address("h0", "o0")), None);
        let outcome = vpc_outcome(&resp).unwrap();
        assert_eq!(outcome.object_id, "o0");
        assert_eq!(outcome.session_key, "sk-o0");
    }
}
