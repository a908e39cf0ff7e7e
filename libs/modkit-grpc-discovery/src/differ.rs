use crate::error::ResolverError;
use crate::instance::ServiceInstance;
use crate::target::TargetExtractor;

/// Whether `new` differs from the last published `old` list.
///
/// Two lists are equal when they have the same length and every old instance
/// has a new one with the same host and the same gRPC port. Order is ignored.
/// The nested scan is quadratic; instance lists are small.
///
/// # Errors
/// Returns `ResolverError::InvalidPort` if port metadata of any compared
/// instance is malformed.
pub fn needs_update(
    extractor: &TargetExtractor,
    old: &[ServiceInstance],
    new: &[ServiceInstance],
) -> Result<bool, ResolverError> {
    if old.len() != new.len() {
        return Ok(true);
    }
    let new_ports = new
        .iter()
        .map(|inst| extractor.grpc_port(inst))
        .collect::<Result<Vec<_>, _>>()?;

    for instance in old {
        let port = extractor.grpc_port(instance)?;
        let same = new
            .iter()
            .zip(&new_ports)
            .any(|(candidate, &candidate_port)| {
                candidate.host == instance.host && candidate_port == port
            });
        if !same {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetadataKeys;

    fn extractor() -> TargetExtractor {
        TargetExtractor::new("orders", MetadataKeys::default())
    }

    fn a() -> ServiceInstance {
        ServiceInstance::new("orders", "a", "10.0.0.1", 8080).with_metadata("gRPC_port", "9090")
    }

    fn b() -> ServiceInstance {
        ServiceInstance::new("orders", "b", "10.0.0.2", 8080)
    }

    #[test]
    fn identical_lists_need_no_update() {
        assert!(!needs_update(&extractor(), &[a(), b()], &[a(), b()]).unwrap());
    }

    #[test]
    fn permutation_needs_no_update() {
        assert!(!needs_update(&extractor(), &[a(), b()], &[b(), a()]).unwrap());
    }

    #[test]
    fn size_change_needs_update() {
        assert!(needs_update(&extractor(), &[a(), b()], &[a()]).unwrap());
        assert!(needs_update(&extractor(), &[], &[a()]).unwrap());
    }

    #[test]
    fn port_change_needs_update() {
        let moved = a().with_metadata("gRPC_port", "9191");
        assert!(needs_update(&extractor(), &[a(), b()], &[moved, b()]).unwrap());
    }

    #[test]
    fn host_change_needs_update() {
        let moved = ServiceInstance::new("orders", "b", "10.0.0.3", 8080);
        assert!(needs_update(&extractor(), &[a(), b()], &[a(), moved]).unwrap());
    }

    #[test]
    fn declared_port_and_metadata_port_compare_by_effective_port() {
        // same effective port, once from metadata and once declared
        let declared = ServiceInstance::new("orders", "a", "10.0.0.1", 9090);
        assert!(!needs_update(&extractor(), &[a()], &[declared]).unwrap());
    }

    #[test]
    fn instance_id_is_not_compared() {
        let renamed = ServiceInstance::new("orders", "b-2", "10.0.0.2", 8080);
        assert!(!needs_update(&extractor(), &[b()], &[renamed]).unwrap());
    }

    #[test]
    fn malformed_port_is_an_error() {
        let bad = b().with_metadata("gRPC_port", "nope");
        assert!(needs_update(&extractor(), &[b()], &[bad]).is_err());
    }
}
