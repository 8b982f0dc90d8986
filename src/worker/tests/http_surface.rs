//! HTTP surface tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use distbuild_core::config::WorkerConfig;
use distbuild_core::error::{BuildError, Result};
use distbuild_core::instruction::Instruction;
use distbuild_core::log::LogConfig;
use distbuild_core::response::StepResponse;
use distbuild_core::unit::BuildUnit;
use distbuild_runtime::layer::diff_from_files;
use distbuild_runtime::{
    DiskLayerStore, LayerStore, PullSource, StepExecutor, StepHandle, StepOrchestrator,
    StepRequest, StoredImage,
};
use distbuild_worker::server::router;
use tempfile::TempDir;
use tower::ServiceExt;

struct NotFound;

#[async_trait]
impl PullSource for NotFound {
    async fn pull(&self, reference: &str) -> Result<String> {
        Err(BuildError::Registry {
            registry: "docker.io".to_string(),
            message: format!("manifest for {} not found", reference),
        })
    }
}

struct TouchFile {
    store: Arc<dyn LayerStore>,
}

struct TouchHandle {
    store: Arc<dyn LayerStore>,
    parent: StoredImage,
}

#[async_trait]
impl StepExecutor for TouchFile {
    async fn prepare(&self, request: StepRequest) -> Result<Box<dyn StepHandle>> {
        Ok(Box::new(TouchHandle {
            store: self.store.clone(),
            parent: request.image,
        }))
    }
}

#[async_trait]
impl StepHandle for TouchHandle {
    async fn execute(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<StoredImage> {
        let diff = diff_from_files(&[("tmp/touched", b"")])?;
        let put = self
            .store
            .put_layer(Some(&self.parent.top_layer), &diff)
            .await?;
        self.store.create_image(&[], &put.layer.id).await
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

async fn app(config: &WorkerConfig) -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
    let base = store
        .put_layer(None, &diff_from_files(&[("etc/alpine-release", b"3.19")]).unwrap())
        .await
        .unwrap();
    store
        .create_image(&["docker.io/library/alpine:latest".to_string()], &base.layer.id)
        .await
        .unwrap();

    let executor = Arc::new(TouchFile {
        store: store.clone(),
    });
    let orchestrator = Arc::new(StepOrchestrator::new(
        store,
        Arc::new(NotFound),
        executor,
        LogConfig::default(),
    ));
    (tmp, router(orchestrator, config))
}

async fn post(app: Router, body: Vec<u8>) -> (StatusCode, StepResponse) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn touch(base: &str) -> Vec<u8> {
    BuildUnit::new(
        base,
        Instruction::Run {
            command: "touch /tmp/touched".to_string(),
        },
    )
    .encode()
    .unwrap()
}

#[tokio::test]
async fn healthz_returns_ok() {
    let (_tmp, app) = app(&WorkerConfig::default()).await;
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 16).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn successful_step_returns_diff() {
    let (_tmp, app) = app(&WorkerConfig::default()).await;
    let (status, response) = post(app, touch("alpine")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.success);
    assert!(response.error.is_none());
    let diff = response.diff.unwrap();
    assert_eq!(diff, diff_from_files(&[("tmp/touched", b"")]).unwrap());
}

#[tokio::test]
async fn undecodable_body_is_a_client_error() {
    let (_tmp, app) = app(&WorkerConfig::default()).await;
    let (status, response) = post(app, b"{not json".to_vec()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!response.success);
    assert!(response.diff.is_none());
    assert!(response
        .error
        .unwrap()
        .starts_with("could not decode build unit"));
}

#[tokio::test]
async fn pull_failure_is_reported_in_body() {
    let (_tmp, app) = app(&WorkerConfig::default()).await;
    let (status, response) = post(app, touch("registry.example.com/missing:1.0")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(!response.success);
    let error = response.error.unwrap();
    assert!(error.starts_with("could not resolve image"));
    assert!(error.contains("not found"));
}

#[tokio::test]
async fn unit_without_instruction_fails() {
    let (_tmp, app) = app(&WorkerConfig::default()).await;
    let body = serde_json::to_vec(&serde_json::json!({ "baseImageRef": "alpine" })).unwrap();
    let (status, response) = post(app, body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.error.as_deref(), Some("no instruction specified"));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = WorkerConfig {
        max_body_bytes: 64,
        ..Default::default()
    };
    let (_tmp, app) = app(&config).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from(vec![b' '; 1024]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
