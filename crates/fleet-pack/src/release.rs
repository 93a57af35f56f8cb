//! Release gate: the only way a package becomes released.

use fleet_state::{PackageArtifact, ReleaseTarget, StateStore};
use tracing::{info, warn};

use crate::error::PackResult;

/// Release every package resolved from `target` when the caller's
/// checksums match the resolved set exactly (order-insensitive).
///
/// Explicit ids are preferred over a query. On any mismatch nothing is
/// released.
pub fn release(
    store: &StateStore,
    checksums: &[String],
    target: &ReleaseTarget,
) -> PackResult<Vec<PackageArtifact>> {
    match store.release_packages(target, checksums) {
        Ok(released) => {
            for pkg in &released {
                info!(package = %pkg.key(), id = pkg.id, checksum = %pkg.checksum, "package released");
            }
            Ok(released)
        }
        Err(err) => {
            warn!(?target, error = %err, "release rejected");
            Err(err.into())
        }
    }
}
