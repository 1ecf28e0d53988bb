//! Default word list for three-word references.
//!
//! Short, lowercase, unambiguous nouns. 256 words give
//! 16,581,120 distinct ordered triplets.

/// Words used by [`ReferenceCodec::with_default_words`](super::ReferenceCodec::with_default_words).
pub const DEFAULT_WORDS: &[&str] = &[
    "acorn", "acre", "alder", "alpine", "amber", "anchor", "apple", "apricot", "arch", "arrow",
    "aspen", "atlas", "autumn", "badge", "badger", "bamboo", "banner", "barley", "basil",
    "basin", "bay", "beacon", "beetle", "bell", "berry", "birch", "bison", "blade", "blanket",
    "blizzard", "blossom", "bluff", "bonnet", "border", "boulder", "bracket", "bramble",
    "branch", "breeze", "brick", "bridge", "brook", "bucket", "buffalo", "bundle", "butter",
    "cabin", "cable", "cactus", "cairn", "camel", "canal", "candle", "canoe", "canyon", "cape",
    "carbon", "cargo", "carpet", "cashew", "castle", "cavern", "cedar", "cellar", "chalk",
    "cherry", "chestnut", "chimney", "cider", "cinder", "circle", "citrus", "cliff", "cloud",
    "clover", "cobalt", "cocoa", "comb", "comet", "copper", "coral", "cotton", "cove",
    "cradle", "crater", "creek", "crow", "crystal", "cumin", "cypress", "dahlia", "daisy",
    "dawn", "delta", "desert", "dew", "dolphin", "dragon", "drift", "dune", "dusk", "eagle",
    "elm", "ember", "engine", "fable", "falcon", "feather", "fern", "fiddle", "field", "fig",
    "fjord", "flame", "flint", "forest", "fossil", "fountain", "fox", "frost", "galaxy",
    "gale", "garden", "garnet", "gazelle", "geyser", "ginger", "glacier", "glade", "globe",
    "granite", "grape", "gravel", "grove", "gull", "harbor", "harvest", "hawk", "hazel",
    "heath", "hemlock", "heron", "hill", "hollow", "honey", "horizon", "iris", "island",
    "ivory", "jade", "jasmine", "jungle", "juniper", "kelp", "kettle", "kiwi", "ladder",
    "lagoon", "lantern", "lark", "lava", "leaf", "ledge", "lemon", "lilac", "lily", "linen",
    "lizard", "lotus", "lynx", "magnet", "mango", "maple", "marble", "marsh", "meadow",
    "melon", "mesa", "meteor", "mint", "mirror", "mist", "moon", "moss", "mountain", "nectar",
    "needle", "nickel", "nutmeg", "oak", "oasis", "ocean", "olive", "onyx", "orange", "orbit",
    "orchid", "osprey", "otter", "owl", "paddle", "panda", "paper", "peach", "pearl", "pebble",
    "pelican", "pepper", "pier", "pine", "planet", "plover", "plum", "pond", "poppy",
    "prairie", "pumpkin", "quail", "quartz", "quill", "rabbit", "rain", "raven", "reed",
    "reef", "ribbon", "ridge", "river", "robin", "rocket", "saddle", "saffron", "sage",
    "salmon", "sand", "satin", "scarf", "seal", "sequoia", "shadow", "shell", "shore",
    "silver", "sky", "slate", "snow", "sparrow", "spring", "spruce", "star", "stone", "storm",
    "stream", "summit", "sunset", "swan",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_words_are_distinct_and_lowercase() {
        let unique: HashSet<_> = DEFAULT_WORDS.iter().collect();
        assert_eq!(unique.len(), DEFAULT_WORDS.len());
        assert!(DEFAULT_WORDS
            .iter()
            .all(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_lowercase())));
    }
}
