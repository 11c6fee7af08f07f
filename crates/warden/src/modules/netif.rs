//! Network interface hardware address

use crate::error::WorkerError;
use std::path::Path;

/// Hardware address of `interface`, as exposed under `sysfs_net`.
pub fn hardware_address(sysfs_net: &Path, interface: &str) -> Result<String, WorkerError> {
    if interface.is_empty() || interface.contains('/') || interface == "." || interface == ".." {
        return Err(WorkerError::InvalidArgument);
    }

    let path = sysfs_net.join(interface).join("address");
    let text = std::fs::read_to_string(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            WorkerError::Open {
                path: path.clone(),
                source,
            }
        } else {
            WorkerError::Read {
                path: path.clone(),
                source,
            }
        }
    })?;

    let address = text.trim();
    if address.is_empty() {
        return Err(WorkerError::Read {
            path,
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty address"),
        });
    }
    Ok(address.to_string())
}
