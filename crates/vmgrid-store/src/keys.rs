//! Key layout.
//!
//! ```text
//! /sf/<objecttype>/<subtype>/<name>       objects
//! /sf/queue/<queuename>/<jobname>         waiting work items
//! /sf/processing/<queuename>/<jobname>    claimed work items
//! /sf/cache/<objecttype>/<state>          state cache buckets
//! /sflocks/sf/<objecttype>/<subtype>/<name>   lock records
//! ```

/// Lock records live under their own root so they never collide with data.
pub const LOCK_PREFIX: &str = "/sflocks";

/// Build an object key. Empty `subtype` or `name` segments are omitted;
/// when `name` is empty the key ends in `/` and acts as a prefix.
pub fn construct_key(objecttype: &str, subtype: &str, name: &str) -> String {
    match (subtype.is_empty(), name.is_empty()) {
        (false, false) => format!("/sf/{objecttype}/{subtype}/{name}"),
        (true, false) => format!("/sf/{objecttype}/{name}"),
        (false, true) => format!("/sf/{objecttype}/{subtype}/"),
        (true, true) => format!("/sf/{objecttype}/"),
    }
}

/// The lock key guarding an object path.
pub fn lock_key(path: &str) -> String {
    format!("{LOCK_PREFIX}{path}")
}

/// Final path segment of a key (`/sf/queue/q/123-000` → `123-000`).
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
