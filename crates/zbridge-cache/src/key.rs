//! Cache key generation and cacheability detection.

use serde_json::Value;
use sha2::{Digest, Sha256};
use zbridge_core::AuthContext;

/// Closed registry of read-only command-name prefixes. New cacheable
/// command families are added here, nowhere else.
const CACHEABLE_PREFIXES: &[&str] = &["list", "get", "search", "find", "fetch", "query"];

/// Whether a command's result may be served from the cache. Either the
/// command name starts with a read-only prefix or the envelope carries an
/// explicit `event: read` marker.
pub fn is_cacheable(command: &str, event: Option<&str>) -> bool {
    if event == Some("read") {
        return true;
    }
    let lowered = command.to_lowercase();
    CACHEABLE_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

/// Deterministically derive a cache key from the command, its normalized
/// argument set, and the caller's identity. Two distinct identity tuples can
/// never collide: every identity field is embedded in the key. Identity is
/// omitted entirely when absent so unauthenticated discovery calls share one
/// slot.
pub fn generate_key(command: &str, args: &Value, identity: Option<&AuthContext>) -> String {
    // serde_json orders object keys, so serialization is canonical.
    let digest = Sha256::digest(args.to_string().as_bytes());
    let args_hex = hex(&digest);

    match identity {
        Some(ctx) => format!(
            "cmd:{command}|args:{args_hex}|user:{}|app:{}|role:{}|scope:{}",
            ctx.user_id,
            ctx.app_name,
            ctx.role,
            ctx.scope_tag()
        ),
        None => format!("cmd:{command}|args:{args_hex}"),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
