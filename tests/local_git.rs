//! Local git registries backed by throwaway repositories

mod helper;

use std::sync::Arc;
use std::time::Duration;

use arm::config::ArmConfig;
use arm::ruleset::cache::ContentCache;
use arm::ruleset::error::{ConfigError, LocalRepositoryError, RegistryError};
use arm::ruleset::manager::RegistryManager;
use arm::ruleset::registries::git::git_available;
use arm::ruleset::types::ContentSelector;
use helper::TestRepo;
use rstest::rstest;
use tempfile::TempDir;

struct Fixture {
    repo: TestRepo,
    v1: String,
    feature: String,
    head: String,
}

/// main: v1.0.0 -> v2.0.0 -> untagged HEAD; `feature` branches off v1.0.0
fn fixture() -> Fixture {
    let repo = TestRepo::init();
    let v1 = repo.commit("v1", &[("rules/style.md", "one"), ("notes.txt", "n")]);
    repo.tag("v1.0.0");
    repo.checkout_new_branch("feature");
    let feature = repo.commit("feature", &[("rules/extra.md", "extra")]);
    repo.checkout("main");
    repo.commit("v2", &[("rules/style.md", "two")]);
    repo.tag("v2.0.0");
    let head = repo.commit("unreleased", &[("rules/style.md", "head")]);
    Fixture {
        repo,
        v1,
        feature,
        head,
    }
}

fn manager_for(repo_path: &std::path::Path, cache_dir: &TempDir) -> RegistryManager {
    let config = ArmConfig::from_json_str(
        &serde_json::json!({
            "registries": {
                "local": { "type": "local-git", "url": repo_path.to_string_lossy() }
            }
        })
        .to_string(),
    )
    .unwrap();
    let cache = Arc::new(ContentCache::new(cache_dir.path(), Duration::from_secs(300)));
    RegistryManager::from_config_with_cache(&config, cache)
}

#[tokio::test]
async fn latest_is_default_branch_head_not_highest_tag() {
    if !git_available() {
        return;
    }
    let fixture = fixture();
    let cache_dir = TempDir::new().unwrap();
    let manager = manager_for(fixture.repo.path(), &cache_dir);
    let dest = cache_dir.path().join("out");

    let installed = manager
        .download_ruleset("rules", "latest", &dest, &ContentSelector::new(["rules/*.md"]))
        .await
        .unwrap();

    assert_eq!(installed.resolved_version.as_str(), fixture.head);
    assert_eq!(std::fs::read_to_string(dest.join("rules/style.md")).unwrap(), "head");
    assert!(!dest.join("notes.txt").exists());
}

#[tokio::test]
async fn range_resolves_to_highest_matching_tag() {
    if !git_available() {
        return;
    }
    let fixture = fixture();
    let cache_dir = TempDir::new().unwrap();
    let manager = manager_for(fixture.repo.path(), &cache_dir);
    let dest = cache_dir.path().join("out");

    let installed = manager
        .download_ruleset("rules", "^1.0", &dest, &ContentSelector::default())
        .await
        .unwrap();

    assert_eq!(installed.resolved_version.as_str(), "v1.0.0");
    assert_eq!(std::fs::read_to_string(dest.join("rules/style.md")).unwrap(), "one");
    assert!(dest.join("notes.txt").exists());
}

#[tokio::test]
async fn branch_and_commit_specifiers_resolve_to_commits() {
    if !git_available() {
        return;
    }
    let fixture = fixture();
    let cache_dir = TempDir::new().unwrap();
    let manager = manager_for(fixture.repo.path(), &cache_dir);

    let branch = manager.resolve_version("rules", "feature").await.unwrap();
    let commit = manager.resolve_version("rules", &fixture.v1).await.unwrap();

    assert_eq!(branch.as_str(), fixture.feature);
    assert_eq!(commit.as_str(), fixture.v1);
}

#[tokio::test]
async fn versions_list_latest_then_tags_then_branches() {
    if !git_available() {
        return;
    }
    let fixture = fixture();
    let cache_dir = TempDir::new().unwrap();
    let manager = manager_for(fixture.repo.path(), &cache_dir);

    let versions = manager.list_versions("rules").await.unwrap();

    assert_eq!(versions, vec!["latest", "v2.0.0", "v1.0.0", "feature", "main"]);
}

#[tokio::test]
async fn moved_repository_only_fails_its_own_installs() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("moved-away");
    let manager = manager_for(&missing, &temp_dir);

    assert_eq!(manager.registry_names(), vec!["local"]);
    let error = manager
        .download_ruleset("rules", "latest", temp_dir.path(), &ContentSelector::default())
        .await
        .unwrap_err();

    assert_eq!(error.registry, "local");
    let RegistryError::Misconfigured { source, .. } = &error.source else {
        panic!("expected misconfigured registry, got {error}");
    };
    assert!(matches!(
        source.as_ref(),
        ConfigError::LocalRepository(LocalRepositoryError::Moved { .. })
    ));
}

#[tokio::test]
async fn missing_parent_directory_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("gone").join("rules");
    let manager = manager_for(&missing, &temp_dir);

    let error = manager.resolve_version("rules", "latest").await.unwrap_err();

    let RegistryError::Misconfigured { source, .. } = &error.source else {
        panic!("expected misconfigured registry, got {error}");
    };
    assert!(matches!(
        source.as_ref(),
        ConfigError::LocalRepository(LocalRepositoryError::NotFound { .. })
    ));
}

#[rstest]
#[case::latest("latest")]
#[case::commit("0123456789abcdef0123456789abcdef01234567")]
#[tokio::test]
async fn repository_deleted_after_startup_is_reported_as_moved(#[case] spec: &str) {
    if !git_available() {
        return;
    }
    let fixture = fixture();
    let cache_dir = TempDir::new().unwrap();
    let manager = manager_for(fixture.repo.path(), &cache_dir);
    std::fs::remove_dir_all(fixture.repo.path()).unwrap();

    let error = manager
        .download_ruleset("rules", spec, &cache_dir.path().join("out"), &ContentSelector::default())
        .await
        .unwrap_err();

    assert!(
        matches!(
            error.source,
            RegistryError::LocalRepository(LocalRepositoryError::Moved { .. })
        ),
        "{error}"
    );
}
