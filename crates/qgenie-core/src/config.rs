//! Centralized configuration constants for qgenie.
//!
//! File names inside an unpack directory, container format parameters and
//! size limits live here so the resolver, the codec and the CLI agree on them.

/// Layout of an unpacked bundle directory.
pub struct BundleConfig;

impl BundleConfig {
    /// Manifest file name at the root of every unpacked bundle.
    pub const MANIFEST_FILE_NAME: &'static str = "config.json";
    /// Advisory lock taken while a directory is being unpacked.
    pub const LOCK_FILE_NAME: &'static str = ".qgenie.lock";
    /// File name of the bundled default HTP extension config.
    pub const DEFAULT_EXTENSIONS_FILE_NAME: &'static str = "htp_backend_ext_config.json";
    /// Environment variable the CLI reads for the default extensions path.
    pub const DEFAULT_EXTENSIONS_ENV: &'static str = "QGENIE_DEFAULT_EXTENSIONS";
}

/// `QGENIE1` container format parameters.
pub struct ContainerConfig;

impl ContainerConfig {
    pub const MAGIC: &'static [u8; 7] = b"QGENIE1";
    pub const VERSION: u16 = 1;
    /// magic(7) + version(2) + reserved(4) + three u64 offsets.
    pub const HEADER_LEN: usize = 7 + 2 + 4 + 8 + 8 + 8;
    /// Fixed part of a TOC entry after the name: offset, comp_length,
    /// raw_length (u64 each) and crc32.
    pub const TOC_FIXED_LEN: usize = 8 + 8 + 8 + 4;
    /// Trailing global CRC32.
    pub const FOOTER_LEN: usize = 4;
    /// Upper bound for the decompressed manifest.
    pub const MAX_CONFIG_BYTES: usize = 10 * 1024 * 1024;
    pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
    pub const MIN_ZSTD_LEVEL: i32 = -7;
    pub const MAX_ZSTD_LEVEL: i32 = 22;
}
