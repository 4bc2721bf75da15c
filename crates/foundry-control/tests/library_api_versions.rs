//! Integration tests for API versions and generated library bindings.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use common::{counting_callback, ctx, wait_for_count, wait_for_status, TestFactory};
use foundry_control::backend::GenerationTarget;
use foundry_control::{
    ApiVersion, BuildOutcome, Callback, FactoryError, Language, Library, LibraryApiVersion,
    LibraryKind, Resource, Status,
};
use rstest::{fixture, rstest};

#[fixture]
fn harness() -> TestFactory {
    TestFactory::new()
}

async fn library(
    harness: &TestFactory,
    component_id: &foundry_control::ResourceId,
    kind: LibraryKind,
) -> Library {
    harness
        .factory
        .libraries()
        .list(&ctx(), component_id)
        .await
        .unwrap()
        .into_iter()
        .find(|lib| lib.language == Language::Java && lib.kind == kind)
        .unwrap()
}

#[rstest]
#[tokio::test]
async fn api_version_commits_and_tags_the_spec(harness: TestFactory) {
    let component = harness.ready_component().await;
    let api_version = harness.ready_api_version(&component).await;

    assert_eq!(api_version.version, "1.0.0");
    assert_eq!(harness.vcs.tags("acme/orders/api"), vec!["1.0.0".to_owned()]);

    let err = harness
        .factory
        .api_versions()
        .create(&ctx(), &component, "1.0.0", common::ORDERS_SPEC, Callback::none())
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::AlreadyExists { .. }));

    let err = harness
        .factory
        .api_versions()
        .create(&ctx(), &component, "v2", common::ORDERS_SPEC, Callback::none())
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::Validation(_)));

    let listed = harness
        .factory
        .api_versions()
        .list(&ctx(), component.id())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[rstest]
#[tokio::test]
async fn binding_is_ready_once_commit_and_build_are(harness: TestFactory) {
    let component = harness.ready_component().await;
    let api_version = harness.ready_api_version(&component).await;
    let client = library(&harness, component.id(), LibraryKind::Client).await;
    let fired = Arc::new(AtomicUsize::new(0));

    let binding = harness
        .factory
        .library_api_versions()
        .create(&ctx(), api_version.id(), client.id(), counting_callback(&fired))
        .await
        .unwrap()
        .into_resource();
    assert_eq!(binding.api_repository_status, Status::Pending);
    assert_eq!(binding.pipeline_status, Status::Pending);

    let ready =
        wait_for_status::<LibraryApiVersion>(harness.inventory(), binding.id(), Status::Ready)
            .await;
    assert!(ready.parts_ready());
    wait_for_count(&fired, 1).await;

    let generated = harness.generator.generated();
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].target, GenerationTarget::Library(LibraryKind::Client));
    assert_eq!(generated[0].artifact_group, "com.foundry.acme");
    assert_eq!(harness.vcs.tags("acme/orders/java-client"), vec!["1.0.0".to_owned()]);

    let err = harness
        .factory
        .library_api_versions()
        .create(&ctx(), api_version.id(), client.id(), Callback::none())
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::AlreadyExists { .. }));
}

#[rstest]
#[tokio::test]
async fn failed_binding_build_keeps_commit_status(harness: TestFactory) {
    let component = harness.ready_component().await;
    let api_version = harness.ready_api_version(&component).await;
    let server = library(&harness, component.id(), LibraryKind::Server).await;
    harness
        .ci
        .set_outcome("acme/orders/java-server", BuildOutcome::Fail);
    let fired = Arc::new(AtomicUsize::new(0));

    let binding = harness
        .factory
        .library_api_versions()
        .create(&ctx(), api_version.id(), server.id(), counting_callback(&fired))
        .await
        .unwrap()
        .into_resource();

    let failed =
        wait_for_status::<LibraryApiVersion>(harness.inventory(), binding.id(), Status::Error)
            .await;
    assert_eq!(failed.api_repository_status, Status::Ready);
    assert_eq!(failed.pipeline_status, Status::Error);
    wait_for_count(&fired, 1).await;
}

#[rstest]
#[tokio::test]
async fn failed_generation_marks_commit_status(harness: TestFactory) {
    let component = harness.ready_component().await;
    let api_version = harness.ready_api_version(&component).await;
    let client = library(&harness, component.id(), LibraryKind::Client).await;
    let builds_before = harness.ci.submitted_builds("acme/orders/java-client").len();
    harness.generator.fail_generation(true);
    let fired = Arc::new(AtomicUsize::new(0));

    let binding = harness
        .factory
        .library_api_versions()
        .create(&ctx(), api_version.id(), client.id(), counting_callback(&fired))
        .await
        .unwrap()
        .into_resource();

    let failed =
        wait_for_status::<LibraryApiVersion>(harness.inventory(), binding.id(), Status::Error)
            .await;
    assert_eq!(failed.api_repository_status, Status::Error);
    assert_eq!(failed.pipeline_status, Status::Pending);
    wait_for_count(&fired, 1).await;
    assert_eq!(
        harness.ci.submitted_builds("acme/orders/java-client").len(),
        builds_before
    );
}

#[rstest]
#[tokio::test]
async fn pending_api_version_cannot_be_bound(harness: TestFactory) {
    let component = harness.ready_component().await;
    let client = library(&harness, component.id(), LibraryKind::Client).await;
    let pending = harness
        .inventory()
        .api_versions
        .insert(
            &ctx(),
            ApiVersion {
                header: foundry_control::model::Header::pending(),
                component_id: component.id().clone(),
                version: "3.0.0".to_owned(),
            },
        )
        .await
        .unwrap();

    let err = harness
        .factory
        .library_api_versions()
        .create(&ctx(), pending.id(), client.id(), Callback::none())
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::NotReady { .. }));
}

#[rstest]
#[tokio::test]
async fn deleting_an_api_version_removes_its_bindings(harness: TestFactory) {
    let component = harness.ready_component().await;
    let api_version = harness.ready_api_version(&component).await;
    let client = library(&harness, component.id(), LibraryKind::Client).await;
    let binding = harness
        .factory
        .library_api_versions()
        .create(&ctx(), api_version.id(), client.id(), Callback::none())
        .await
        .unwrap()
        .into_resource();
    wait_for_status::<LibraryApiVersion>(harness.inventory(), binding.id(), Status::Ready).await;

    let err = harness
        .factory
        .libraries()
        .delete(&ctx(), client.id(), false, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::Validation(_)));

    let api_versions = harness.factory.api_versions();
    api_versions.delete(&ctx(), api_version.id()).await.unwrap();
    api_versions.delete(&ctx(), api_version.id()).await.unwrap();

    assert!(harness
        .factory
        .library_api_versions()
        .list(&ctx(), api_version.id())
        .await
        .unwrap()
        .is_empty());
    harness
        .factory
        .libraries()
        .delete(&ctx(), client.id(), false, true)
        .await
        .unwrap();
}
