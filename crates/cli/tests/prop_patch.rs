//! Property tests - create_patch output applies back to the modified text

use editgate_cli::core::{apply_patch, create_patch};
use proptest::prelude::*;

fn text() -> impl Strategy<Value = String> {
    let line = prop::sample::select(vec!["", "a", "b", "c", "fn x() {", "}", "  indented", "tab\there"]);
    let eol = prop::sample::select(vec!["\n", "\n", "\r\n"]);
    (prop::collection::vec((line, eol), 0..16), any::<bool>()).prop_map(|(lines, terminated)| {
        let mut out: String = lines.iter().map(|(l, e)| format!("{l}{e}")).collect();
        if !terminated && out.ends_with('\n') {
            out.pop();
            if out.ends_with('\r') {
                out.pop();
            }
        }
        out
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn patch_round_trips(original in text(), modified in text()) {
        let diff = create_patch(&original, &modified, "file.txt");
        let patched = apply_patch(&original, &diff);
        prop_assert!(patched.is_ok(), "apply failed: {:?}\n{}", patched, diff);
        prop_assert_eq!(patched.unwrap_or_default(), modified);
    }

    #[test]
    fn identical_texts_give_an_empty_diff(original in text()) {
        prop_assert_eq!(create_patch(&original, &original, "same.txt"), "");
    }
}
