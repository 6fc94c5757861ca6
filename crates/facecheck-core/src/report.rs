//! Report building and rendering.
//!
//! [`build_report`] turns an analysis run into a [`ReportDocument`]: gallery,
//! per-image attributes, comparison table and failures list, all in upload
//! order. The same run always produces an equal document. Renderers turn the
//! document into a downloadable artifact.

use crate::config::{AnalysisConfig, DistanceMetric};
use crate::run::AnalysisRun;
use crate::search::{reverse_search_links, ImageRef, SearchLink};
use crate::types::{EmotionEstimate, Gender, ImageId, Labeled, Outcome, Race};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("formatting failed")]
    Format(#[from] fmt::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reference,
    Probe,
}

/// Pipeline stage at which an image failed. Ordered as the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Extraction,
    Comparison,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Ingest => "ingest",
            Stage::Extraction => "extraction",
            Stage::Comparison => "comparison",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryEntry {
    pub image_id: ImageId,
    pub filename: String,
    pub role: Role,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub digest: String,
    pub search_links: Vec<SearchLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeRow {
    pub image_id: ImageId,
    pub filename: String,
    pub age: Option<f32>,
    pub gender: Option<Labeled<Gender>>,
    pub emotion: Option<EmotionEstimate>,
    pub race: Option<Labeled<Race>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub image_id: ImageId,
    pub filename: String,
    pub reference_id: ImageId,
    pub distance: f32,
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRow {
    pub image_id: ImageId,
    pub filename: String,
    pub stage: Stage,
    pub reason: String,
}

/// Structured report for one run; the input to every renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportDocument {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub config: AnalysisConfig,
    pub reference: Option<ImageId>,
    pub gallery: Vec<GalleryEntry>,
    pub attributes: Vec<AttributeRow>,
    pub comparisons: Vec<ComparisonRow>,
    pub failures: Vec<FailureRow>,
}

/// Build the report for `run`.
///
/// Works on partially failed runs: failed images appear in the failures list
/// and are absent from the attribute or comparison section they failed in.
pub fn build_report(run: &AnalysisRun) -> ReportDocument {
    let reference = run.reference();
    let mut filenames: BTreeMap<ImageId, &str> = BTreeMap::new();

    let gallery = run
        .images()
        .iter()
        .map(|img| {
            filenames.insert(img.id, &img.filename);
            GalleryEntry {
                image_id: img.id,
                filename: img.filename.clone(),
                role: if Some(img.id) == reference {
                    Role::Reference
                } else {
                    Role::Probe
                },
                format: img.format.clone(),
                width: img.width(),
                height: img.height(),
                digest: img.digest.clone(),
                search_links: reverse_search_links(ImageRef::Local),
            }
        })
        .collect();

    let filename = |id: &ImageId| filenames.get(id).copied().unwrap_or_default().to_string();
    let mut failures: Vec<FailureRow> = run
        .rejected()
        .iter()
        .map(|r| FailureRow {
            image_id: r.id,
            filename: r.filename.clone(),
            stage: Stage::Ingest,
            reason: r.error.to_string(),
        })
        .collect();

    let mut attributes = Vec::new();
    for (id, outcome) in run.attributes() {
        match outcome {
            Outcome::Ok(result) => attributes.push(AttributeRow {
                image_id: *id,
                filename: filename(id),
                age: result.attributes.age,
                gender: result.attributes.gender.clone(),
                emotion: result.attributes.emotion.clone(),
                race: result.attributes.race.clone(),
            }),
            Outcome::Failed(reason) => failures.push(FailureRow {
                image_id: *id,
                filename: filename(id),
                stage: Stage::Extraction,
                reason: reason.to_string(),
            }),
        }
    }

    let mut comparisons = Vec::new();
    for (id, outcome) in run.comparisons() {
        match outcome {
            Outcome::Ok(result) => comparisons.push(ComparisonRow {
                image_id: *id,
                filename: filename(id),
                reference_id: result.reference_id,
                distance: result.distance,
                threshold: result.threshold,
                metric: result.metric,
                verified: result.verified,
            }),
            Outcome::Failed(reason) => failures.push(FailureRow {
                image_id: *id,
                filename: filename(id),
                stage: Stage::Comparison,
                reason: reason.to_string(),
            }),
        }
    }

    failures.sort_by_key(|f| (f.image_id, f.stage));

    ReportDocument {
        run_id: run.id,
        created_at: run.created_at,
        config: run.config.clone(),
        reference,
        gallery,
        attributes,
        comparisons,
        failures,
    }
}

/// Turns a report document into a downloadable artifact.
pub trait ReportRenderer {
    fn content_type(&self) -> &'static str;
    fn file_extension(&self) -> &'static str;
    fn render(&self, report: &ReportDocument) -> Result<Vec<u8>, RenderError>;
}

/// Pretty-printed JSON of the whole document.
pub struct JsonRenderer;

impl ReportRenderer for JsonRenderer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn file_extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, report: &ReportDocument) -> Result<Vec<u8>, RenderError> {
        let mut out = serde_json::to_vec_pretty(report)?;
        out.push(b'\n');
        Ok(out)
    }
}

/// One row per uploaded entry, rejected uploads included.
pub struct CsvRenderer;

const CSV_HEADER: [&str; 14] = [
    "image_id",
    "filename",
    "role",
    "age",
    "gender",
    "gender_confidence",
    "emotion",
    "emotion_confidence",
    "race",
    "race_confidence",
    "distance",
    "threshold",
    "verified",
    "error",
];

impl ReportRenderer for CsvRenderer {
    fn content_type(&self) -> &'static str {
        "text/csv"
    }

    fn file_extension(&self) -> &'static str {
        "csv"
    }

    fn render(&self, report: &ReportDocument) -> Result<Vec<u8>, RenderError> {
        let mut rows: BTreeMap<ImageId, [String; 14]> = BTreeMap::new();

        for entry in &report.gallery {
            let row = rows.entry(entry.image_id).or_default();
            row[0] = entry.image_id.ordinal().to_string();
            row[1] = entry.filename.clone();
            row[2] = match entry.role {
                Role::Reference => "reference".into(),
                Role::Probe => "probe".into(),
            };
        }
        for attr in &report.attributes {
            let row = rows.entry(attr.image_id).or_default();
            if let Some(age) = attr.age {
                row[3] = format!("{age:.1}");
            }
            if let Some(gender) = &attr.gender {
                row[4] = gender.label.to_string();
                row[5] = format!("{:.4}", gender.confidence);
            }
            if let Some(emotion) = &attr.emotion {
                row[6] = emotion.dominant.to_string();
                row[7] = format!("{:.4}", emotion.confidence());
            }
            if let Some(race) = &attr.race {
                row[8] = race.label.to_string();
                row[9] = format!("{:.4}", race.confidence);
            }
        }
        for cmp in &report.comparisons {
            let row = rows.entry(cmp.image_id).or_default();
            row[10] = format!("{:.4}", cmp.distance);
            row[11] = format!("{:.4}", cmp.threshold);
            row[12] = cmp.verified.to_string();
        }
        for failure in &report.failures {
            let row = rows.entry(failure.image_id).or_default();
            if failure.stage == Stage::Ingest {
                row[0] = failure.image_id.ordinal().to_string();
                row[1] = failure.filename.clone();
                row[2] = "rejected".into();
            }
            if !row[13].is_empty() {
                row[13].push_str("; ");
            }
            write!(row[13], "{}: {}", failure.stage, failure.reason)?;
        }

        let mut out = String::new();
        write_csv_record(&mut out, CSV_HEADER.iter().copied())?;
        for row in rows.values() {
            write_csv_record(&mut out, row.iter().map(String::as_str))?;
        }
        Ok(out.into_bytes())
    }
}

fn write_csv_record<'a>(
    out: &mut String,
    fields: impl Iterator<Item = &'a str>,
) -> Result<(), fmt::Error> {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            write!(out, "\"{}\"", field.replace('"', "\"\""))?;
        } else {
            out.push_str(field);
        }
    }
    out.push_str("\r\n");
    Ok(())
}
