//! Memorable-but-random short strings for workload values.

use rand::rngs::SmallRng;
use rand::Rng;

const CORPUS: &[&str] = &[
    "acorn", "amber", "anvil", "apron", "badge", "bagel", "basil", "bison",
    "blaze", "bluff", "brick", "broom", "cabin", "cedar", "chalk", "cider",
    "clamp", "cliff", "cobra", "coral", "crane", "crisp", "delta", "dome",
    "drift", "ember", "fable", "fern", "flint", "frost", "gale", "gecko",
    "glade", "gourd", "grove", "gust", "hazel", "heron", "husk", "ivory",
    "jade", "kelp", "lark", "ledge", "lilac", "lotus", "maple", "marsh",
    "mint", "moss", "noble", "nook", "olive", "onyx", "otter", "pearl",
    "pine", "plume", "quartz", "reef", "sable", "thorn", "umber", "wren",
];

/// Generate a short string of three corpus words joined by dashes.
pub(crate) fn gen_word(rng: &mut SmallRng) -> String {
    let mut out = String::new();
    for i in 0..3 {
        if i > 0 {
            out.push('-');
        }
        out.push_str(CORPUS[rng.gen_range(0..CORPUS.len())]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn words_are_three_dashed_parts() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..32 {
            let word = gen_word(&mut rng);
            let parts: Vec<&str> = word.split('-').collect();
            assert_eq!(parts.len(), 3);
            for part in parts {
                assert!(CORPUS.contains(&part), "unexpected part {part:?}");
            }
        }
    }

    #[test]
    fn words_are_never_empty() {
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..32 {
            assert!(!gen_word(&mut rng).is_empty());
        }
    }
}
