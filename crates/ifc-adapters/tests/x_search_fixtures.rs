use std::path::PathBuf;

use ifc_adapters::parse_post_page;

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/x-search/sample")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn conversation_fixture_parses_posts_with_own_permalinks() {
    let parsed = parse_post_page(&fixture("conversation.html")).unwrap();
    assert!(!parsed.login_wall);
    assert_eq!(parsed.posts.len(), 2);

    let first = &parsed.posts[0];
    assert_eq!(first.id, "1894200000000000002");
    assert_eq!(first.author_handle, "asha_dev");
    assert_eq!(first.author_display_name, "Asha Rao");
    assert!(first.text.starts_with("Loving the new Indus update!"));
    assert_eq!(
        first.posted_at.map(|t| t.to_rfc3339()),
        Some("2026-02-25T11:20:00+00:00".to_string())
    );

    // the quoted post link must not replace the reply's own id
    let second = &parsed.posts[1];
    assert_eq!(second.id, "1894100000000000001");
    assert_eq!(second.author_handle, "ravi_k");
}

#[test]
fn login_wall_fixture_is_detected() {
    let parsed = parse_post_page(&fixture("login_wall.html")).unwrap();
    assert!(parsed.posts.is_empty());
    assert!(parsed.login_wall);
}
