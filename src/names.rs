//! Human-readable display names for freshly minted keys ("quiet falcon",
//! "amber harbor"). Owners rename keys later; these only need to be friendly
//! and collision-tolerant, not unique.

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "coral", "crisp", "dusty", "eager", "fancy",
    "gentle", "golden", "happy", "ivory", "jolly", "keen", "lively", "lucky", "mellow", "misty",
    "noble", "opal", "proud", "quiet", "rapid", "royal", "shiny", "silent", "solar", "sunny",
    "swift", "tidy", "vivid", "warm", "wild", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "breeze", "canyon", "cedar", "comet", "coyote", "crane", "dolphin",
    "falcon", "fjord", "garnet", "glacier", "harbor", "heron", "island", "jaguar", "lagoon",
    "lantern", "lynx", "maple", "meadow", "meteor", "otter", "panda", "pebble", "pine", "raven",
    "reef", "river", "sparrow", "summit", "tiger", "tundra", "walrus", "willow",
];

/// Two random dictionary words separated by a space.
pub fn generate() -> String {
    let mut buf = [0u8; 4];
    // Zeroed buffer on RNG failure still yields a valid (fixed) name.
    let _ = getrandom::fill(&mut buf);
    let adjective = ADJECTIVES[usize::from(buf[0]) % ADJECTIVES.len()];
    let noun = NOUNS[usize::from(buf[1]) % NOUNS.len()];
    format!("{adjective} {noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_two_known_words() {
        let name = generate();
        let mut parts = name.split(' ');
        let adjective = parts.next().expect("adjective");
        let noun = parts.next().expect("noun");
        assert!(parts.next().is_none());
        assert!(ADJECTIVES.contains(&adjective));
        assert!(NOUNS.contains(&noun));
    }
}
