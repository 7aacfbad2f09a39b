use super::*;

async fn memory_registry() -> Registry {
    Registry::open("sqlite::memory:").await.expect("registry")
}

fn sheet(file_id: &str) -> SheetRef {
    SheetRef {
        file_id: file_id.to_string(),
        folder_id: "root-folder".to_string(),
        url: format!("https://sheets.example/{file_id}"),
    }
}

#[tokio::test]
async fn registers_new_puzzle() {
    let registry = memory_registry().await;
    let slug = Slug::new("Foo Bar");
    let puzzle = registry.register(&slug, "Foo Bar").await.expect("register");

    assert_eq!(puzzle.slug, slug);
    assert_eq!(puzzle.display_name, "Foo Bar");
    assert_eq!(puzzle.status, PuzzleStatus::New);
    assert!(puzzle.channel_ref.is_none());
    assert!(puzzle.sheet_ref.is_none());
}

#[tokio::test]
async fn rejects_duplicate_slug() {
    let registry = memory_registry().await;
    let slug = Slug::new("Foo Bar");
    registry.register(&slug, "Foo Bar").await.expect("first");

    // Distinct display name, same derived slug.
    let second = Slug::new("foo   bar!");
    assert_eq!(second, slug);
    let err = registry.register(&second, "foo   bar!").await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateSlug(s) if s == slug));
}

#[tokio::test]
async fn find_reports_not_found() {
    let registry = memory_registry().await;
    let err = registry.find(&Slug::new("missing")).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}

#[tokio::test]
async fn channel_link_is_set_once() {
    let registry = memory_registry().await;
    let slug = Slug::new("linked");
    registry.register(&slug, "linked").await.expect("register");

    let channel = ChannelRef("chan-1".into());
    registry
        .set_channel_ref(&slug, &channel)
        .await
        .expect("first link");

    // Same value twice is idempotent.
    let again = registry
        .set_channel_ref(&slug, &channel)
        .await
        .expect("idempotent relink");
    assert_eq!(again.channel_ref, Some(channel));

    let err = registry
        .set_channel_ref(&slug, &ChannelRef("chan-2".into()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::AlreadyLinked {
            side: LinkSide::Channel,
            ..
        }
    ));
}

#[tokio::test]
async fn sheet_link_identity_is_the_file_id() {
    let registry = memory_registry().await;
    let slug = Slug::new("sheeted");
    registry.register(&slug, "sheeted").await.expect("register");

    registry
        .set_sheet_ref(&slug, &sheet("file-1"))
        .await
        .expect("first link");

    // Same file reported from a different folder is still the same sheet.
    let mut moved = sheet("file-1");
    moved.folder_id = "archive-folder".into();
    registry
        .set_sheet_ref(&slug, &moved)
        .await
        .expect("idempotent relink");

    let err = registry
        .set_sheet_ref(&slug, &sheet("file-2"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::AlreadyLinked {
            side: LinkSide::Sheet,
            ..
        }
    ));
}

#[tokio::test]
async fn transition_enforces_full_table() {
    for from in PuzzleStatus::all() {
        for to in PuzzleStatus::all() {
            let registry = memory_registry().await;
            let slug = Slug::new("table");
            registry.register(&slug, "table").await.expect("register");
            force_status(&registry, &slug, from).await;

            let result = registry.transition(&slug, to).await;
            if from.allows_transition_to(to) {
                let puzzle = result.unwrap_or_else(|e| panic!("{from} -> {to} failed: {e}"));
                assert_eq!(puzzle.status, to);
            } else {
                let err = result.expect_err(&format!("{from} -> {to} should fail"));
                assert!(matches!(
                    err,
                    RegistryError::IllegalTransition { from: f, to: t, .. } if f == from && t == to
                ));
            }
        }
    }
}

#[tokio::test]
async fn transition_updates_status_change_timestamp() {
    let registry = memory_registry().await;
    let slug = Slug::new("stamped");
    let before = registry.register(&slug, "stamped").await.expect("register");

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let after = registry
        .transition(&slug, PuzzleStatus::Active)
        .await
        .expect("transition");

    assert!(after.last_status_change_at > before.last_status_change_at);
    assert_eq!(after.created_at, before.created_at);
}

#[tokio::test]
async fn import_active_is_idempotent() {
    let registry = memory_registry().await;
    let slug = Slug::new("Discovered Puzzle");
    let channel = ChannelRef("chan-9".into());

    let imported = registry
        .import_active(&slug, "Discovered Puzzle", &channel, &sheet("file-9"))
        .await
        .expect("import");
    assert_eq!(imported.status, PuzzleStatus::Active);
    assert_eq!(imported.channel_ref, Some(channel.clone()));

    let again = registry
        .import_active(&slug, "Discovered Puzzle", &channel, &sheet("file-9"))
        .await
        .expect("reimport");
    assert_eq!(again.created_at, imported.created_at);
    assert_eq!(registry.list().await.expect("list").len(), 1);
}

#[tokio::test]
async fn list_orders_by_creation() {
    let registry = memory_registry().await;
    for name in ["First", "Second", "Third"] {
        registry
            .register(&Slug::new(name), name)
            .await
            .expect("register");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    let names: Vec<String> = registry
        .list()
        .await
        .expect("list")
        .into_iter()
        .map(|p| p.display_name)
        .collect();
    assert_eq!(names, vec!["First", "Second", "Third"]);
}

#[tokio::test]
async fn solved_count_survives_archiving() {
    let registry = memory_registry().await;
    for name in ["a", "b"] {
        let slug = Slug::new(name);
        registry.register(&slug, name).await.expect("register");
        force_status(&registry, &slug, PuzzleStatus::Solved).await;
    }
    registry
        .register(&Slug::new("c"), "c")
        .await
        .expect("register");
    assert_eq!(registry.count_solved().await.expect("count"), 2);

    registry
        .transition(&Slug::new("a"), PuzzleStatus::Archived)
        .await
        .expect("archive");
    assert_eq!(registry.count_solved().await.expect("count"), 2);
}

#[tokio::test]
async fn sheet_owner_reports_the_linked_puzzle() {
    let registry = memory_registry().await;
    let slug = Slug::new("owned");
    registry.register(&slug, "owned").await.expect("register");
    registry
        .set_sheet_ref(&slug, &sheet("file-1"))
        .await
        .expect("link");

    let owner = registry.sheet_owner("file-1").await.expect("owner");
    assert_eq!(owner, Some(slug));
    assert_eq!(registry.sheet_owner("file-2").await.expect("owner"), None);
}

#[tokio::test]
async fn health_check_passes_on_an_open_database() {
    let registry = memory_registry().await;
    registry.health_check().await.expect("health check");
}

/// Walks the puzzle to an arbitrary status through legal transitions so the
/// table test can start from anywhere.
async fn force_status(registry: &Registry, slug: &Slug, status: PuzzleStatus) {
    let path: &[PuzzleStatus] = match status {
        PuzzleStatus::New => &[],
        PuzzleStatus::Active => &[PuzzleStatus::Active],
        PuzzleStatus::Solved => &[PuzzleStatus::Active, PuzzleStatus::Solved],
        PuzzleStatus::Archived => &[
            PuzzleStatus::Active,
            PuzzleStatus::Solved,
            PuzzleStatus::Archived,
        ],
        PuzzleStatus::Broken => &[PuzzleStatus::Broken],
    };
    for step in path {
        registry.transition(slug, *step).await.expect("force step");
    }
}
