//! End-to-end runs of the orchestrator against a stub feed and real
//! GeoPackage layers on disk.

mod common;

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use geocore_core::{PipelineConfig, TaskOrchestrator};
use geocore_registry::{marker, Severity, TaskId, TaskRegistry, TaskStatus};
use tempfile::TempDir;

fn config(feed: &StubFeed, dir: &TempDir, layers: &str) -> PipelineConfig {
    PipelineConfig {
        feed_url: feed.url.clone(),
        output_root: dir.path().join("outputs"),
        layer_root: dir.path().join(layers),
        fetch_timeout: Duration::from_secs(10),
        layer_timeout: Duration::from_secs(30),
        ..PipelineConfig::default()
    }
}

fn orchestrator(config: PipelineConfig) -> TaskOrchestrator {
    TaskOrchestrator::from_config(config, Arc::new(TaskRegistry::new()))
}

fn refs(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn zip_names(path: &std::path::Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

fn messages_with(orch: &TaskOrchestrator, id: &TaskId, severity: Severity) -> Vec<String> {
    orch.registry()
        .entries(id)
        .unwrap()
        .into_iter()
        .filter(|e| e.severity == severity)
        .map(|e| e.message)
        .collect()
}

#[tokio::test]
async fn absent_reference_is_logged_once_and_batch_completes() {
    let feed = spawn_feed().await;
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&feed, &dir, "capas"));

    let id = orch
        .run("expediente.txt", refs(&[KNOWN_REFERENCE, ABSENT_REFERENCE]))
        .await;

    assert_eq!(orch.registry().status(&id).unwrap(), TaskStatus::Completed);
    let errors = messages_with(&orch, &id, Severity::Error);
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert!(errors[0].contains(ABSENT_REFERENCE));
    assert!(errors[0].starts_with("[expediente.txt] "));

    let archive = orch.registry().archive(&id).unwrap().unwrap();
    let gml: Vec<_> = zip_names(&archive)
        .into_iter()
        .filter(|n| n.ends_with(".gml"))
        .collect();
    assert_eq!(gml, vec![format!("0001_{}.gml", KNOWN_REFERENCE)]);
    assert_eq!(feed.requests(), 2);
}

#[tokio::test]
async fn containing_protected_area_is_detected() {
    let feed = spawn_feed().await;
    let dir = TempDir::new().unwrap();
    write_layer(
        &dir.path().join("capas/espacios/red_natura.gpkg"),
        "red_natura",
        4258,
        &[(madrid_protected_area(), "ZEPA Madrid")],
    );
    write_layer(
        &dir.path().join("capas/montes/montes_publicos.gpkg"),
        "montes",
        25830,
        &[(distant_forest(), "Monte lejano")],
    );
    let orch = orchestrator(config(&feed, &dir, "capas"));

    let id = orch.run("natura", refs(&[KNOWN_REFERENCE])).await;

    assert_eq!(orch.registry().status(&id).unwrap(), TaskStatus::Completed);
    let hits = messages_with(&orch, &id, Severity::Success);
    let detected: Vec<_> = hits
        .iter()
        .filter(|m| m.contains("INTERSECCIÓN DETECTADA"))
        .collect();
    assert_eq!(detected.len(), 1, "{:?}", hits);
    assert!(detected[0].contains("espacios/red_natura.gpkg: 1 elementos."));
    assert!(messages_with(&orch, &id, Severity::Error).is_empty());

    let affections = std::fs::read_to_string(
        dir.path()
            .join("outputs")
            .join(id.as_str())
            .join("afecciones_resultados.csv"),
    )
    .unwrap();
    assert!(affections.contains(&format!(
        "{},espacios/red_natura.gpkg,1",
        KNOWN_REFERENCE
    )));
}

#[tokio::test]
async fn missing_layer_root_warns_once_and_completes() {
    let feed = spawn_feed().await;
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&feed, &dir, "no-existe"));

    let id = orch
        .run("sin-capas", refs(&[KNOWN_REFERENCE, NEIGHBOUR_REFERENCE]))
        .await;

    assert_eq!(orch.registry().status(&id).unwrap(), TaskStatus::Completed);
    let warnings = messages_with(&orch, &id, Severity::Warning);
    assert_eq!(warnings.len(), 1, "{:?}", warnings);
    assert!(warnings[0].contains("no-existe"));
    assert!(messages_with(&orch, &id, Severity::Success)
        .iter()
        .all(|m| !m.contains("INTERSECCIÓN")));
}

#[tokio::test]
async fn archive_keeps_submission_order_and_reports() {
    let feed = spawn_feed().await;
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&feed, &dir, "capas"));

    let id = orch
        .run(
            "orden",
            refs(&[NEIGHBOUR_REFERENCE, BROKEN_REFERENCE, KNOWN_REFERENCE]),
        )
        .await;

    let archive = orch.registry().archive(&id).unwrap().unwrap();
    assert_eq!(
        archive,
        dir.path()
            .join("outputs")
            .join(format!("{}_resultados.zip", id))
    );
    assert_eq!(
        zip_names(&archive),
        vec![
            format!("0001_{}.gml", NEIGHBOUR_REFERENCE),
            // malformed geometry still leaves its payload behind
            format!("0002_{}.gml", BROKEN_REFERENCE),
            format!("0003_{}.gml", KNOWN_REFERENCE),
            "DATOS_CATASTRALES.csv".to_string(),
            "afecciones_resultados.csv".to_string(),
            "log.txt".to_string(),
        ]
    );

    let errors = messages_with(&orch, &id, Severity::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(BROKEN_REFERENCE));

    let parcels = std::fs::read_to_string(
        dir.path()
            .join("outputs")
            .join(id.as_str())
            .join("DATOS_CATASTRALES.csv"),
    )
    .unwrap();
    assert!(parcels.contains(&format!(
        "{r},EPSG:25830,10000.00,{r}",
        r = KNOWN_REFERENCE
    )));
}

#[tokio::test]
async fn service_exception_is_a_per_reference_error() {
    let feed = spawn_feed().await;
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&feed, &dir, "capas"));

    let id = orch
        .run("excepcion", refs(&[EXCEPTION_REFERENCE, KNOWN_REFERENCE]))
        .await;

    assert_eq!(orch.registry().status(&id).unwrap(), TaskStatus::Completed);
    let errors = messages_with(&orch, &id, Severity::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(EXCEPTION_REFERENCE));
    assert!(errors[0].contains("servicio de Catastro"));

    let task_dir = dir.path().join("outputs").join(id.as_str());
    assert!(!task_dir
        .join(format!("0001_{}.gml", EXCEPTION_REFERENCE))
        .exists());
    assert!(task_dir
        .join(format!("0002_{}.gml", KNOWN_REFERENCE))
        .is_file());
}

#[tokio::test]
async fn unreachable_feed_fails_references_not_task() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        feed_url: "http://127.0.0.1:9/wfs".to_string(),
        output_root: dir.path().join("outputs"),
        layer_root: dir.path().join("capas"),
        fetch_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    };
    let orch = orchestrator(config);
    let id = orch.run("offline", refs(&["A", "B"])).await;

    assert_eq!(orch.registry().status(&id).unwrap(), TaskStatus::Completed);
    assert_eq!(messages_with(&orch, &id, Severity::Error).len(), 2);
}

#[tokio::test]
async fn polling_a_finished_task_is_stable() {
    let feed = spawn_feed().await;
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&feed, &dir, "capas"));
    let id = orch.run("estable", refs(&[KNOWN_REFERENCE])).await;

    let first = orch.registry().poll(&id, 0).unwrap();
    assert!(first.completed);
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(
        first.result_url.as_deref(),
        Some(format!("/api/download/{}", id).as_str())
    );
    let last = first.logs.last().unwrap();
    assert_eq!(
        marker::result_location("estable", &last.message),
        first.result_url.as_deref()
    );

    for _ in 0..5 {
        let again = orch.registry().poll(&id, 0).unwrap();
        assert_eq!(again.logs, first.logs);
        assert!(again.completed);
        assert_eq!(again.next_index, first.next_index);
    }

    let tail = orch.registry().poll(&id, first.next_index).unwrap();
    assert!(tail.logs.is_empty());
    assert!(tail.completed);
}
