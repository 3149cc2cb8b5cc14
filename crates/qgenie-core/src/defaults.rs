//! Default HTP backend extension config shipped with the resolver.
//!
//! When a `QnnHtp` engine's `backend.extensions` does not point at a file in
//! the unpacked bundle, the resolver substitutes the path of this document.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::BundleConfig;
use crate::error::Result;
use crate::fsutil::atomic_write;

/// Default extension config for the HTP backend.
pub const DEFAULT_HTP_EXTENSIONS: &str = r#"{
    "devices": [
        {
            "soc_model": 60,
            "dsp_arch": "v73",
            "cores": [
                {
                    "core_id": 0,
                    "perf_profile": "burst",
                    "rpc_control_latency": 100
                }
            ]
        }
    ],
    "memory": {
        "mem_type": "shared_buffer"
    },
    "context": {
        "weight_sharing_enabled": true
    }
}
"#;

/// Where the default extension config lives when none is configured:
/// next to the running executable.
pub fn default_extensions_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(BundleConfig::DEFAULT_EXTENSIONS_FILE_NAME)
}

/// Write [`DEFAULT_HTP_EXTENSIONS`] to `path` unless a file is already there.
///
/// Returns `true` if the file was written.
pub fn install_default_extensions(path: &Path) -> Result<bool> {
    if path.is_file() {
        return Ok(false);
    }
    atomic_write(path, DEFAULT_HTP_EXTENSIONS.as_bytes())?;
    info!("Installed default HTP extension config at {}", path.display());
    Ok(true)
}
