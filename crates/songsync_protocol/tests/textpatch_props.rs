//! Property tests for the field patch codec.

use proptest::prelude::*;
use songsync_protocol::{apply_patch_text, make_patch_text, Document, DocumentId, FieldPatchSet, TextPatch};

fn text() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[a-c \n%]{0,40}",
        "\\PC{0,60}",
        prop::collection::vec(prop::sample::select(vec!["la ", "Amen", "\n", "\r\n", "ä", "%0A", "@@"]), 0..20)
            .prop_map(|parts| parts.concat()),
    ]
}

proptest! {
    #[test]
    fn apply_of_diff_yields_target(a in text(), b in text()) {
        let patch = make_patch_text(&a, &b);
        let outcome = apply_patch_text(&a, &patch).unwrap();
        prop_assert_eq!(&outcome.text, &b);
        prop_assert!(outcome.is_clean());
        prop_assert_eq!(patch.is_empty(), a == b);
    }

    #[test]
    fn text_form_parses_back(a in text(), b in text()) {
        let patch = TextPatch::make(&a, &b);
        let parsed = TextPatch::parse(&patch.to_string()).unwrap();
        prop_assert_eq!(parsed, patch);
    }

    #[test]
    fn field_sets_rebuild_documents(
        base in prop::collection::btree_map("[a-d]", text(), 0..4),
        target in prop::collection::btree_map("[a-d]", text(), 0..4),
    ) {
        let id = DocumentId::new();
        let base = Document::from_fields(id, base);
        let target = Document::from_fields(id, target);
        let set = FieldPatchSet::between(Some(&base), &target);
        prop_assert_eq!(set.is_empty(), base == target);
        let applied = set.apply_to(id, Some(&base));
        prop_assert!(applied.is_clean());
        prop_assert_eq!(applied.document, target);
    }
}
