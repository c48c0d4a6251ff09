//! Request handlers, one module per endpoint group.

pub mod containers;
pub mod exec;
pub mod images;
pub mod mirrors;
pub mod system;

use serde::{Deserialize, Deserializer};

/// Docker clients send booleans as `1`/`0` as well as `true`/`false`.
pub(crate) fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(matches!(
        raw.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    ))
}
