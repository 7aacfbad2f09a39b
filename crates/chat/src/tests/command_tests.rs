use super::*;

#[test]
fn parses_register_with_free_text_name() {
    let cmd = parse_command("!", "!register The Great Gatsby");
    assert_eq!(
        cmd,
        Some(Command::Register {
            name: "The Great Gatsby".into()
        })
    );
}

#[test]
fn parses_solved_and_archive_with_normalized_slug() {
    assert_eq!(
        parse_command("!", "!solved Foo Bar"),
        Some(Command::Solved {
            slug: Slug::new("foo-bar")
        })
    );
    assert_eq!(
        parse_command("!", "!archive foo-bar"),
        Some(Command::Archive {
            slug: Slug::new("foo-bar")
        })
    );
}

#[test]
fn parses_status_with_and_without_slug() {
    assert_eq!(
        parse_command("!", "!status"),
        Some(Command::Status { slug: None })
    );
    assert_eq!(
        parse_command("!", "!status duck-konundrum"),
        Some(Command::Status {
            slug: Some(Slug::new("duck-konundrum"))
        })
    );
}

#[test]
fn parses_recount() {
    assert_eq!(parse_command("!", "!recount"), Some(Command::Recount));
}

#[test]
fn honors_configured_prefix() {
    assert_eq!(parse_command("?", "!status"), None);
    assert_eq!(
        parse_command("puzzle ", "puzzle status"),
        Some(Command::Status { slug: None })
    );
}

#[test]
fn ignores_chatter_and_malformed_invocations() {
    assert_eq!(parse_command("!", "anyone looked at the meta?"), None);
    assert_eq!(parse_command("!", "!register"), None);
    assert_eq!(parse_command("!", "!solved"), None);
    assert_eq!(parse_command("!", "!archive   "), None);
    assert_eq!(parse_command("!", "!frobnicate foo"), None);
    assert_eq!(parse_command("!", ""), None);
}

#[test]
fn tolerates_surrounding_whitespace() {
    assert_eq!(
        parse_command("!", "  !solved foo-bar  "),
        Some(Command::Solved {
            slug: Slug::new("foo-bar")
        })
    );
}
