//! Container names and ids.

use andock_core::error::{AndockError, Result};
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "crisp", "eager", "fancy", "gentle", "happy", "jolly", "keen",
    "lucid", "merry", "nimble", "quiet", "rapid", "serene", "sharp", "silent", "stoic", "sunny",
    "swift", "tender", "vivid", "witty", "zealous", "bold", "clever", "dreamy", "frosty", "loyal",
];

const NOUNS: &[&str] = &[
    "albatross", "badger", "beaver", "condor", "dolphin", "falcon", "gecko", "heron", "ibis",
    "jaguar", "kestrel", "lemur", "marmot", "narwhal", "ocelot", "otter", "panda", "puffin",
    "quokka", "raven", "salmon", "tapir", "toucan", "urchin", "walrus", "wombat", "yak", "zebra",
    "lynx", "osprey",
];

/// A random `adjective_noun` name.
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adj}_{noun}")
}

/// Names must match `[a-zA-Z0-9][a-zA-Z0-9_.-]*`. A leading `/` as sent by
/// Docker clients is stripped.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if !valid {
        return Err(AndockError::InvalidRequest(format!(
            "Invalid container name ({}), only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed",
            name
        )));
    }
    Ok(name.to_string())
}

/// 64 hex chars, like Docker container ids.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
