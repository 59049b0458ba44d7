//! Process exit codes of `matbench`. Scripts driving long sweeps rely on them.

pub const SUCCESS: i32 = 0;
pub const CASE_FAILED: i32 = 1; // At least one case stopped on a failure
pub const CONFIG_ERROR: i32 = 2; // Bad config, bad flags, or an internal error
pub const INTERRUPTED: i32 = 130; // Ctrl-C; records are consistent up to the last block
