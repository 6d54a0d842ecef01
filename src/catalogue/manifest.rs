//! Catalogue manifest loading.
//!
//! A manifest is a JSON document carrying descriptor metadata, either
//! `{"functions": [...]}` or a bare array. Each entry is normalised into a
//! [`FunctionDescriptor`] and bound to the built-in callable of the same name.

use super::{is_identifier, Catalogue, FunctionDescriptor};
use crate::error::AppError;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Result type for manifest operations
pub type ManifestResult<T> = std::result::Result<T, AppError>;

/// Maximum description length before truncation
const MAX_DESCRIPTION_LENGTH: usize = 500;

/// Category assigned to entries that omit one.
const DEFAULT_CATEGORY: &str = "general";

/// Parse a manifest document into descriptors.
///
/// # Errors
/// Returns `AppError::CatalogueError` if the document has no function array,
/// or if every entry in a non-empty array is malformed. Individual malformed
/// entries are logged and skipped (partial success model).
pub fn parse_manifest(json: &Value) -> ManifestResult<Vec<FunctionDescriptor>> {
    let entries = extract_functions_array(json)?;

    let mut results = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();

    for (idx, entry) in entries.iter().enumerate() {
        match normalize_entry(entry) {
            Ok(descriptor) if !seen.insert(descriptor.name.clone()) => {
                tracing::warn!(
                    index = idx,
                    function = %descriptor.name,
                    "Skipping duplicate function definition"
                );
            }
            Ok(descriptor) => results.push(descriptor),
            Err(e) => {
                tracing::warn!(
                    index = idx,
                    error = %e,
                    "Skipping malformed function definition"
                );
            }
        }
    }

    if results.is_empty() && !entries.is_empty() {
        return Err(AppError::CatalogueError(
            "All function definitions failed to parse".into(),
        ));
    }

    tracing::debug!(
        total = entries.len(),
        parsed = results.len(),
        "Manifest parsing complete"
    );

    Ok(results)
}

/// Build the live catalogue: the built-ins, optionally re-described by the
/// manifest at `path`.
pub fn load_catalogue(path: Option<&Path>) -> ManifestResult<Catalogue> {
    let builtin = Catalogue::builtin();
    let Some(path) = path else {
        return Ok(builtin);
    };

    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::CatalogueError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let json: Value = serde_json::from_str(&raw).map_err(|e| {
        AppError::CatalogueError(format!("Invalid JSON in {}: {}", path.display(), e))
    })?;

    let descriptors = parse_manifest(&json)?;
    let catalogue = builtin.rebind(descriptors)?;

    tracing::info!(
        path = %path.display(),
        functions = catalogue.len(),
        "Catalogue manifest loaded"
    );

    Ok(catalogue)
}

fn extract_functions_array(json: &Value) -> ManifestResult<&Vec<Value>> {
    json.as_array()
        .or_else(|| json.get("functions").and_then(|f| f.as_array()))
        .ok_or_else(|| {
            AppError::CatalogueError("Expected a 'functions' array in catalogue manifest".into())
        })
}

fn normalize_entry(entry: &Value) -> ManifestResult<FunctionDescriptor> {
    let name = entry
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .ok_or_else(|| {
            AppError::CatalogueError(format!(
                "Function missing required 'name' field: {:?}",
                entry.get("name")
            ))
        })?;

    if !is_identifier(name) {
        return Err(AppError::CatalogueError(format!(
            "Function name '{}' is not an identifier",
            name
        )));
    }

    let description = entry
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");

    let category = entry
        .get("category")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CATEGORY);

    let parameters = string_list(entry.get("parameters"));
    if let Some(bad) = parameters.iter().find(|p| !is_identifier(p)) {
        return Err(AppError::CatalogueError(format!(
            "Parameter '{}' of '{}' is not an identifier",
            bad, name
        )));
    }

    Ok(FunctionDescriptor {
        name: name.to_string(),
        description: truncate_description(description),
        keywords: string_list(entry.get("keywords")),
        category: category.to_string(),
        parameters,
    })
}

/// Trimmed, non-empty strings of a JSON array, deduplicated in order.
fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

/// Truncate description to MAX_DESCRIPTION_LENGTH with ellipsis.
///
/// Attempts to truncate at a word boundary when possible.
fn truncate_description(desc: &str) -> String {
    if desc.len() <= MAX_DESCRIPTION_LENGTH {
        return desc.to_string();
    }

    let mut end = MAX_DESCRIPTION_LENGTH;
    while !desc.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = &desc[..end];

    match truncated.rfind(' ') {
        Some(pos) if pos > MAX_DESCRIPTION_LENGTH - 50 => {
            format!("{}...", &truncated[..pos])
        }
        _ => format!("{}...", truncated),
    }
}
