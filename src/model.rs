use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatePair {
    pub latitude: f64,
    pub longitude: f64,
}

/// Token usage and cost of a single billed extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub model: String,
}

impl ExtractionUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Running usage for a whole ingest run. Owned by the driver; each
/// extraction call hands back its own usage to be added here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub billed_calls: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &ExtractionUsage) {
        self.billed_calls += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.cost_usd += usage.cost_usd;
    }
}

// Model response schema. Scalar leaves stay loose JSON values because the
// model answers with numbers, strings or mixed unit text interchangeably.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportedCoordinates {
    pub lat_long: Option<Value>,
    pub utm: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectIdentification {
    #[serde(rename = "nombre_obra")]
    pub work_name: Option<Value>,
    #[serde(rename = "ubicacion_detallada")]
    pub detailed_location: Option<Value>,
    #[serde(rename = "coordenadas", deserialize_with = "lenient_section")]
    pub reported_coordinates: Option<ReportedCoordinates>,
    #[serde(rename = "laboratorio")]
    pub laboratory: Option<Value>,
    #[serde(rename = "fecha_reporte")]
    pub report_date: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldExploration {
    #[serde(rename = "cantidad_sondeos")]
    pub boring_count: Option<Value>,
    #[serde(rename = "metodologia")]
    pub methodology: Option<Value>,
    #[serde(rename = "profundidad_maxima_explorada_m")]
    pub max_explored_depth_m: Option<Value>,
    #[serde(rename = "presencia_naf")]
    pub groundwater_present: Option<Value>,
    #[serde(rename = "profundidad_naf_m")]
    pub groundwater_depth_m: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexProperties {
    #[serde(rename = "limite_liquido_ll")]
    pub liquid_limit: Option<Value>,
    #[serde(rename = "indice_plasticidad_ip")]
    pub plasticity_index: Option<Value>,
    #[serde(rename = "contenido_agua_promedio")]
    pub average_water_content: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoilCharacterization {
    #[serde(rename = "tipo_suelo_predominante")]
    pub predominant_soil: Option<Value>,
    #[serde(rename = "clasificacion_sucs")]
    pub uscs_class: Option<Value>,
    #[serde(rename = "consistencia_densidad")]
    pub consistency: Option<Value>,
    #[serde(rename = "propiedades_indice", deserialize_with = "lenient_section")]
    pub index_properties: Option<IndexProperties>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundationAlternative {
    #[serde(rename = "tipo_cimentacion")]
    pub foundation_type: Option<Value>,
    #[serde(rename = "capacidad_carga_admisible_ton_m2")]
    pub bearing_capacity_ton_m2: Option<Value>,
    #[serde(rename = "profundidad_desplante_m")]
    pub founding_depth_m: Option<Value>,
    #[serde(rename = "ancho_cimentacion_m")]
    pub width_m: Option<Value>,
    #[serde(rename = "condiciones_calculo")]
    pub calculation_notes: Option<Value>,
    #[serde(rename = "requiere_mejoramiento")]
    pub improvement_required: Option<Value>,
    #[serde(rename = "descripcion_mejoramiento")]
    pub improvement_description: Option<Value>,
}

/// The alternative the laboratory recommends. Captured on its own; it is not
/// checked against the analyzed alternatives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendedFoundation {
    #[serde(rename = "tipo")]
    pub foundation_type: Option<Value>,
    #[serde(rename = "capacidad_carga_admisible_ton_m2")]
    pub bearing_capacity_ton_m2: Option<Value>,
    #[serde(rename = "profundidad_desplante_m")]
    pub founding_depth_m: Option<Value>,
    #[serde(rename = "justificacion")]
    pub justification: Option<Value>,
    #[serde(rename = "requiere_mejoramiento")]
    pub improvement_required: Option<Value>,
    #[serde(rename = "descripcion_mejoramiento")]
    pub improvement_description: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeismicAnalysis {
    #[serde(rename = "zona_sismica")]
    pub zone: Option<Value>,
    #[serde(rename = "coeficiente_sismico")]
    pub coefficient: Option<Value>,
    #[serde(rename = "clasificacion_sitio")]
    pub site_class: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportExtraction {
    #[serde(rename = "identificacion_proyecto", deserialize_with = "lenient_section")]
    pub identification: Option<ProjectIdentification>,
    #[serde(rename = "exploracion_campo", deserialize_with = "lenient_section")]
    pub exploration: Option<FieldExploration>,
    #[serde(rename = "caracterizacion_suelo", deserialize_with = "lenient_section")]
    pub soil: Option<SoilCharacterization>,
    #[serde(
        rename = "alternativas_cimentacion_analizadas",
        deserialize_with = "lenient_list"
    )]
    pub alternatives: Vec<FoundationAlternative>,
    #[serde(rename = "cimentacion_recomendada", deserialize_with = "lenient_section")]
    pub recommended: Option<RecommendedFoundation>,
    #[serde(rename = "analisis_sismico", deserialize_with = "lenient_section")]
    pub seismic: Option<SeismicAnalysis>,
    #[serde(rename = "observaciones_criticas")]
    pub critical_observations: Option<Value>,
}

/// A section the model returned in the wrong shape is treated as absent.
fn lenient_section<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if !value.is_object() {
        return Ok(None);
    }
    Ok(serde_json::from_value(value).ok())
}

fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };

    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

/// Canonical per-store output row. Field names are the persisted column names
/// read by the downstream validator and serving layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRecord {
    #[serde(rename = "Año")]
    pub year: String,
    #[serde(rename = "Ciudad")]
    pub city: String,
    #[serde(rename = "ID_Tienda")]
    pub store_id: String,
    #[serde(rename = "Nombre_Tienda")]
    pub store_name: String,

    #[serde(rename = "Latitud_KMZ")]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitud_KMZ")]
    pub longitude: Option<f64>,

    #[serde(rename = "Nombre_Obra_PDF")]
    pub work_name: Option<Value>,
    #[serde(rename = "Ubicacion_Detallada")]
    pub detailed_location: Option<Value>,
    #[serde(rename = "Laboratorio")]
    pub laboratory: Option<Value>,
    #[serde(rename = "Fecha_Reporte")]
    pub report_date: Option<Value>,

    #[serde(rename = "Cantidad_Sondeos")]
    pub boring_count: Option<Value>,
    #[serde(rename = "Metodologia")]
    pub methodology: Option<Value>,
    #[serde(rename = "Profundidad_Max_Explorada_m")]
    pub max_explored_depth_m: Option<Value>,
    #[serde(rename = "Presencia_NAF")]
    pub groundwater_present: Option<Value>,
    #[serde(rename = "Profundidad_NAF_m")]
    pub groundwater_depth_m: Option<Value>,

    #[serde(rename = "Tipo_Suelo_Predominante")]
    pub predominant_soil: Option<Value>,
    #[serde(rename = "Clasificacion_SUCS")]
    pub uscs_class: Option<Value>,
    #[serde(rename = "Consistencia_Densidad")]
    pub consistency: Option<Value>,
    #[serde(rename = "Limite_Liquido_LL")]
    pub liquid_limit: Option<Value>,
    #[serde(rename = "Indice_Plasticidad_IP")]
    pub plasticity_index: Option<Value>,
    #[serde(rename = "Contenido_Agua_Promedio")]
    pub average_water_content: Option<Value>,

    #[serde(rename = "Alternativas_Cimentacion")]
    pub alternatives: Vec<FoundationAlternative>,

    #[serde(rename = "Tipo_Cimentacion_Recomendado")]
    pub recommended_type: Option<Value>,
    #[serde(rename = "Qadm_Recomendado_ton_m2")]
    pub recommended_capacity_ton_m2: Option<Value>,
    #[serde(rename = "Profundidad_Desplante_m")]
    pub recommended_depth_m: Option<Value>,
    #[serde(rename = "Justificacion_Recomendacion")]
    pub recommendation_justification: Option<Value>,
    #[serde(rename = "Mejoramiento_Requerido")]
    pub improvement_required: Option<Value>,
    #[serde(rename = "Detalles_Mejoramiento")]
    pub improvement_details: Option<Value>,

    #[serde(rename = "Zona_Sismica")]
    pub seismic_zone: Option<Value>,
    #[serde(rename = "Coeficiente_Sismico")]
    pub seismic_coefficient: Option<Value>,
    #[serde(rename = "Clasificacion_Sitio")]
    pub site_class: Option<Value>,

    #[serde(rename = "Observaciones_Criticas")]
    pub critical_observations: Option<Value>,

    #[serde(rename = "Archivo_KMZ")]
    pub geodata_file: Option<String>,
    #[serde(rename = "Archivo_PDF")]
    pub report_file: Option<String>,
    #[serde(rename = "Error_Procesamiento")]
    pub error: Option<String>,

    #[serde(rename = "_usage", skip_serializing_if = "Option::is_none")]
    pub usage: Option<ExtractionUsage>,
    /// Store folder the record was built from. Not a tabular column.
    #[serde(rename = "_carpeta", skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,
}

impl StoreRecord {
    pub fn coordinates(&self) -> Option<CoordinatePair> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(CoordinatePair {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// A store that could not be fully processed, kept for operator review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub store: String,
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub identity: String,
    pub year: String,
    pub city: String,
    pub store_id: String,
    pub store_name: String,
    pub geodata_file: Option<String>,
    pub report_file: Option<String>,
    pub report_size_bytes: Option<u64>,
    pub report_sha256: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub root: String,
    pub store_count: usize,
    pub completed_count: usize,
    pub pending_count: usize,
    pub stores: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPaths {
    pub root: String,
    pub structural_path: String,
    pub sqlite_path: String,
    pub csv_path: String,
    pub error_report_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestCounts {
    pub discovered_stores: usize,
    pub skipped_completed: usize,
    pub processed_stores: usize,
    pub records_total: usize,
    pub records_with_coordinates: usize,
    pub records_with_errors: usize,
    pub error_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub elapsed_secs: f64,
    pub command: String,
    pub paths: IngestPaths,
    pub counts: IngestCounts,
    pub usage: UsageTotals,
    pub warnings: Vec<String>,
}
