//! Execution-name minting.

use rand::seq::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "daring", "eager", "fuzzy", "gentle",
    "golden", "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "plucky", "quiet",
    "rapid", "rustic", "silent", "sturdy", "swift", "tidy", "vivid", "wandering", "witty", "young",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "breeze", "canyon", "comet", "falcon", "fjord", "garden", "glacier",
    "harbor", "heron", "lagoon", "lantern", "marmot", "meadow", "orchid", "otter", "pebble",
    "pine", "quill", "raven", "ridge", "river", "saddle", "sparrow", "summit", "thicket",
    "tundra", "walrus", "willow",
];

/// Mint a process-unique, human-readable execution name. The name
/// prefixes every container and pod created by one invocation.
pub fn execution_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES
        .choose(&mut rng)
        .expect("adjective list is non-empty");
    let noun = NOUNS.choose(&mut rng).expect("noun list is non-empty");
    format!("{adjective}-{noun}")
}
