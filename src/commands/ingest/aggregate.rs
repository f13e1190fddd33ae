use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::commands::inventory::StoreFolder;
use crate::model::{
    CoordinatePair, ExtractionUsage, FoundationAlternative, ReportExtraction, StoreRecord,
};

/// Everything the extractors produced for one store.
#[derive(Debug, Clone, Default)]
pub struct StoreExtraction {
    pub coordinates: Option<CoordinatePair>,
    pub report: Option<ReportExtraction>,
    pub error: Option<String>,
    pub usage: Option<ExtractionUsage>,
    pub geodata_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

pub fn build_store_record(store: &StoreFolder, extraction: StoreExtraction) -> StoreRecord {
    let report = extraction.report.unwrap_or_default();
    let identification = report.identification.unwrap_or_default();
    let exploration = report.exploration.unwrap_or_default();
    let soil = report.soil.unwrap_or_default();
    let index = soil.index_properties.unwrap_or_default();
    let recommended = report.recommended.unwrap_or_default();
    let seismic = report.seismic.unwrap_or_default();

    StoreRecord {
        year: store.year.clone(),
        city: store.city.clone(),
        store_id: store.store_id.clone(),
        store_name: store.store_name.clone(),

        latitude: extraction.coordinates.map(|pair| pair.latitude),
        longitude: extraction.coordinates.map(|pair| pair.longitude),

        work_name: identification.work_name,
        detailed_location: identification.detailed_location,
        laboratory: identification.laboratory,
        report_date: identification.report_date,

        boring_count: exploration.boring_count,
        methodology: exploration.methodology,
        max_explored_depth_m: exploration.max_explored_depth_m,
        groundwater_present: exploration.groundwater_present,
        groundwater_depth_m: exploration.groundwater_depth_m,

        predominant_soil: soil.predominant_soil,
        uscs_class: soil.uscs_class,
        consistency: soil.consistency,
        liquid_limit: index.liquid_limit,
        plasticity_index: index.plasticity_index,
        average_water_content: index.average_water_content,

        alternatives: report.alternatives,

        recommended_type: recommended.foundation_type,
        recommended_capacity_ton_m2: recommended.bearing_capacity_ton_m2,
        recommended_depth_m: recommended.founding_depth_m,
        recommendation_justification: recommended.justification,
        improvement_required: recommended.improvement_required,
        improvement_details: recommended.improvement_description,

        seismic_zone: seismic.zone,
        seismic_coefficient: seismic.coefficient,
        site_class: seismic.site_class,

        critical_observations: report.critical_observations,

        geodata_file: extraction
            .geodata_path
            .map(|path| path.display().to_string()),
        report_file: extraction.report_path.map(|path| path.display().to_string()),
        error: extraction.error,
        usage: extraction.usage,
        store_dir: Some(store.path.display().to_string()),
    }
}

/// Compact JSON for the tabular alternatives column; empty lists have no cell.
pub fn alternatives_cell(alternatives: &[FoundationAlternative]) -> Result<Option<String>> {
    if alternatives.is_empty() {
        return Ok(None);
    }

    serde_json::to_string(alternatives)
        .map(Some)
        .context("failed to serialize foundation alternatives")
}
