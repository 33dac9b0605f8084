pub struct Config;

impl Config {
    /// Largest accepted upload body after base64 decoding.
    pub const MAX_UPLOAD_BYTES: usize = 750 * 1024 * 1024;

    pub const WATCHDOG_INTERVAL_MS: u64 = 30_000;
    pub const IDLE_FINALIZE_MS: u64 = 10 * 60 * 1000;

    pub const DEFAULT_CHUNK_SIZE: usize = 2_000;
    pub const CHUNK_PAD_WIDTH: usize = 4;

    /// Fixed-point cap for HTML-entity cleanup in URL normalization.
    pub const ENTITY_CLEANUP_MAX_PASSES: usize = 8;

    /// Highest `__dupN` suffix probed before a conflict is given up on.
    pub const DUP_SUFFIX_MAX: u32 = 999;

    /// Filename length cap, counted in UTF-16 code units.
    pub const FILENAME_MAX_UTF16: usize = 240;

    pub const RUN_ID_MAX_LEN: usize = 120;
}
