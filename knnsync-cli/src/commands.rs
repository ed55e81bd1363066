//! Subcommand implementations. Each returns the JSON value printed to stdout.

use knnsync_core::codec::{self, Artifact};
use knnsync_core::session::{Principal, SessionContext};
use knnsync_core::{ModelId, ModelSync};
use serde_json::{Value, json};
use std::path::Path;
use tracing::info;

use crate::error::{CliError, CliResult};

pub async fn list(sync: &ModelSync) -> CliResult<Value> {
    let records = sync.catalog().list().await?;
    Ok(serde_json::to_value(records)?)
}

/// Creates the given slot, or the first free one.
pub async fn create(sync: &ModelSync, model_id: Option<&str>) -> CliResult<Value> {
    let record = match model_id {
        Some(id) => sync.catalog().create(&ModelId::parse(id)?).await?,
        None => sync.catalog().create_next().await?,
    };
    Ok(serde_json::to_value(record)?)
}

pub async fn rename(sync: &ModelSync, model_id: &str, name: &str) -> CliResult<Value> {
    let record = sync.catalog().rename(&ModelId::parse(model_id)?, name).await?;
    Ok(serde_json::to_value(record)?)
}

pub async fn delete(sync: &ModelSync, model_id: &str) -> CliResult<Value> {
    let model_id = ModelId::parse(model_id)?;
    let session = SessionContext::new(Principal::admin(), sync.config().embedding_dimension);
    sync.delete_model(&session, &model_id).await?;
    Ok(json!({ "deleted": model_id }))
}

/// Loads a model and reports what was restored.
pub async fn show(sync: &ModelSync, model_id: &str) -> CliResult<Value> {
    let model_id = ModelId::parse(model_id)?;
    let record = sync.catalog().require(&model_id).await?;
    let session = SessionContext::new(Principal::viewer(), sync.config().embedding_dimension);
    let report = sync.load(&session, &model_id).await?;
    let counts = session.store.read().await.dataset().class_counts();

    Ok(json!({
        "modelId": model_id,
        "displayName": record.display_name,
        "datasetVersion": record.dataset_version,
        "backend": record.backend,
        "examples": report.examples,
        "classes": counts,
        "warnings": report.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
        "mismatches": report
            .mismatches
            .iter()
            .map(|m| json!({ "label": m.label, "recorded": m.recorded, "live": m.live }))
            .collect::<Vec<_>>(),
    }))
}

/// Saves an artifact file as the model's new dataset.
pub async fn import(sync: &ModelSync, model_id: &str, file: &Path) -> CliResult<Value> {
    let model_id = ModelId::parse(model_id)?;
    sync.catalog().require(&model_id).await?;
    let bytes = std::fs::read(file).map_err(|e| CliError::io(file, e))?;
    let decoded = codec::decode(&bytes, sync.config().embedding_dimension)?;

    let session = SessionContext::new(Principal::admin(), sync.config().embedding_dimension);
    session.store.write().await.replace(decoded.dataset);
    let outcome = sync.save_model(&session, &model_id).await?;
    info!(model_id = %model_id, version = outcome.version, backend = %outcome.backend, "Imported artifact");

    Ok(json!({
        "modelId": model_id,
        "datasetVersion": outcome.version,
        "backend": outcome.backend,
        "sizeBytes": outcome.size_bytes,
        "chunks": outcome.chunk_count,
        "warnings": decoded
            .warnings
            .iter()
            .map(|w| w.to_string())
            .chain(outcome.warnings.iter().map(|w| w.to_string()))
            .collect::<Vec<_>>(),
    }))
}

/// Writes the model's stored dataset as an artifact file.
pub async fn export(sync: &ModelSync, model_id: &str, file: &Path) -> CliResult<Value> {
    let model_id = ModelId::parse(model_id)?;
    let decoded = sync.router().load(&model_id).await?;
    let artifact = Artifact::from_dataset(&decoded.dataset, decoded.created_at, decoded.updated_at);
    let bytes = artifact.to_bytes()?;
    std::fs::write(file, &bytes).map_err(|e| CliError::io(file, e))?;

    Ok(json!({
        "modelId": model_id,
        "file": file.display().to_string(),
        "bytes": bytes.len(),
        "classes": decoded.dataset.len(),
        "examples": decoded.dataset.total_examples(),
    }))
}
