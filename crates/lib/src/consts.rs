//! Crate-wide constants.

pub const APP_NAME: &str = "conveyor";

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILENAME: &str = "conveyor.toml";

/// Overrides the state root (plans, approvals, locks, records).
pub const ROOT_ENV_VAR: &str = "CONVEYOR_ROOT";

/// Length of truncated object hashes (plan ids).
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// The only digest algorithm registries are expected to speak.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// Length of the revision prefix used for `{short_revision}` tags.
pub const SHORT_REVISION_LEN: usize = 12;
