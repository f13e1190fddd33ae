use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::Value;
use tracing::{error, info, warn};

use super::client::{CompletionClient, CompletionReply, CompletionRequest, ServiceError, UserPayload};
use super::pdf_text::extract_leading_pages_text;
use super::prompt::{EXTRACTION_INSTRUCTION, SYSTEM_PROMPT, TEXT_PAYLOAD_PREAMBLE};
use crate::model::{ExtractionUsage, ReportExtraction};
use crate::shutdown::Sleeper;
use crate::util::truncate_chars;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LARGE_FILE_THRESHOLD_BYTES: u64 = 30 * 1024 * 1024;
pub const DEFAULT_TEXT_FALLBACK_MAX_PAGES: usize = 50;

/// USD per million prompt tokens.
pub const INPUT_COST_PER_MILLION: f64 = 1.75;
/// USD per million completion tokens.
pub const OUTPUT_COST_PER_MILLION: f64 = 14.00;

const RATE_LIMIT_BACKOFF_STEP_SECS: u64 = 30;
const SERVICE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const RAW_SNIPPET_CHARS: usize = 100;

pub const MAX_RETRIES_REACHED: &str = "maximum retries reached";

#[derive(Debug, Clone)]
pub struct ReportExtractorConfig {
    pub max_attempts: u32,
    pub large_file_threshold_bytes: u64,
    pub text_fallback_max_pages: usize,
}

impl Default for ReportExtractorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            large_file_threshold_bytes: DEFAULT_LARGE_FILE_THRESHOLD_BYTES,
            text_fallback_max_pages: DEFAULT_TEXT_FALLBACK_MAX_PAGES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionMode {
    Attachment,
    ExtractedText,
}

impl TransmissionMode {
    pub fn for_size(size_bytes: u64, threshold_bytes: u64) -> Self {
        if size_bytes > threshold_bytes {
            Self::ExtractedText
        } else {
            Self::Attachment
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Extracted {
        report: ReportExtraction,
        usage: ExtractionUsage,
    },
    /// Terminal failure for this report. `usage` is set when the failing
    /// call was still billed (unparseable reply).
    Failed {
        error: String,
        usage: Option<ExtractionUsage>,
    },
    /// An interrupt arrived during a backoff wait.
    Interrupted,
}

pub fn compute_cost(prompt_tokens: u64, completion_tokens: u64) -> f64 {
    prompt_tokens as f64 * INPUT_COST_PER_MILLION / 1_000_000.0
        + completion_tokens as f64 * OUTPUT_COST_PER_MILLION / 1_000_000.0
}

/// Sends soil reports to the extraction service and turns the reply into a
/// [`ReportExtraction`], retrying transient failures with backoff.
pub struct ReportExtractor<'a> {
    client: &'a dyn CompletionClient,
    sleeper: &'a dyn Sleeper,
    config: ReportExtractorConfig,
    json_span: Regex,
}

impl<'a> ReportExtractor<'a> {
    pub fn new(
        client: &'a dyn CompletionClient,
        sleeper: &'a dyn Sleeper,
        config: ReportExtractorConfig,
    ) -> Result<Self> {
        Ok(Self {
            client,
            sleeper,
            config,
            json_span: Regex::new(r"(?s)\{.*\}").context("failed to compile JSON span regex")?,
        })
    }

    pub fn extract(&self, report_path: &Path) -> ReportOutcome {
        let payload = match self.prepare_payload(report_path) {
            Ok(payload) => payload,
            Err(err) => {
                error!(path = %report_path.display(), error = %err, "failed to prepare report payload");
                return ReportOutcome::Failed {
                    error: format!("{err:#}"),
                    usage: None,
                };
            }
        };

        let request = CompletionRequest {
            system: SYSTEM_PROMPT,
            payload: &payload,
            instruction: EXTRACTION_INSTRUCTION,
        };

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 0..max_attempts {
            let final_attempt = attempt + 1 == max_attempts;
            info!(
                path = %report_path.display(),
                attempt = attempt + 1,
                max_attempts,
                "requesting report extraction"
            );

            match self.client.complete(&request) {
                Ok(reply) => {
                    let usage = self.usage_for(&reply);
                    info!(
                        path = %report_path.display(),
                        tokens = usage.total_tokens(),
                        cost_usd = usage.cost_usd,
                        "report extraction call completed"
                    );
                    return match self.parse_reply(&reply.content) {
                        Ok(report) => ReportOutcome::Extracted { report, usage },
                        Err(error) => ReportOutcome::Failed {
                            error,
                            usage: Some(usage),
                        },
                    };
                }
                Err(ServiceError::RateLimited(body)) => {
                    if final_attempt {
                        warn!(body = %truncate_chars(&body, RAW_SNIPPET_CHARS), "rate limited on final attempt");
                        break;
                    }
                    let wait = Duration::from_secs((u64::from(attempt) + 1) * RATE_LIMIT_BACKOFF_STEP_SECS);
                    warn!(wait_secs = wait.as_secs(), "rate limited; backing off before retry");
                    if !self.sleeper.sleep(wait) {
                        return ReportOutcome::Interrupted;
                    }
                }
                Err(err) => {
                    error!(path = %report_path.display(), error = %err, "extraction service error");
                    if final_attempt {
                        return ReportOutcome::Failed {
                            error: err.to_string(),
                            usage: None,
                        };
                    }
                    if !self.sleeper.sleep(SERVICE_ERROR_BACKOFF) {
                        return ReportOutcome::Interrupted;
                    }
                }
            }
        }

        ReportOutcome::Failed {
            error: MAX_RETRIES_REACHED.to_string(),
            usage: None,
        }
    }

    fn prepare_payload(&self, report_path: &Path) -> Result<UserPayload> {
        let size_bytes = fs::metadata(report_path)
            .with_context(|| format!("failed to inspect {}", report_path.display()))?
            .len();
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);

        match TransmissionMode::for_size(size_bytes, self.config.large_file_threshold_bytes) {
            TransmissionMode::Attachment => {
                let data = fs::read(report_path)
                    .with_context(|| format!("failed to read {}", report_path.display()))?;
                let filename = report_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "report.pdf".to_string());

                Ok(UserPayload::Attachment {
                    filename,
                    data_url: format!("data:application/pdf;base64,{}", STANDARD.encode(&data)),
                })
            }
            TransmissionMode::ExtractedText => {
                info!(
                    path = %report_path.display(),
                    size_mb = %format!("{size_mb:.1}"),
                    max_pages = self.config.text_fallback_max_pages,
                    "report too large to attach; sending extracted text"
                );
                let text =
                    extract_leading_pages_text(report_path, self.config.text_fallback_max_pages)?;
                Ok(UserPayload::Text(format!("{TEXT_PAYLOAD_PREAMBLE}{text}")))
            }
        }
    }

    fn usage_for(&self, reply: &CompletionReply) -> ExtractionUsage {
        ExtractionUsage {
            prompt_tokens: reply.prompt_tokens,
            completion_tokens: reply.completion_tokens,
            cost_usd: compute_cost(reply.prompt_tokens, reply.completion_tokens),
            model: self.client.model().to_string(),
        }
    }

    fn parse_reply(&self, content: &str) -> Result<ReportExtraction, String> {
        match parse_report_json(content) {
            Ok(report) => return Ok(report),
            Err(err) => warn!(error = %err, "reply is not a JSON object; attempting repair"),
        }

        if let Some(report) = self.repair(content) {
            info!("recovered JSON object from reply");
            return Ok(report);
        }

        error!(raw = %truncate_chars(content, RAW_SNIPPET_CHARS), "unrecoverable model reply");
        Err(format!(
            "invalid JSON reply from model. Raw: {}...",
            truncate_chars(content, RAW_SNIPPET_CHARS)
        ))
    }

    /// Single repair pass: the outermost brace-delimited span, then its first
    /// balanced object.
    fn repair(&self, content: &str) -> Option<ReportExtraction> {
        let span = self.json_span.find(content)?.as_str();
        parse_report_json(span)
            .ok()
            .or_else(|| balanced_object(span).and_then(|object| parse_report_json(object).ok()))
    }
}

fn parse_report_json(text: &str) -> Result<ReportExtraction, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(<serde_json::Error as serde::de::Error>::custom(
            "reply is not a JSON object",
        ));
    }
    serde_json::from_value(value)
}

/// First balanced `{...}` in `text`, ignoring braces inside JSON strings.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, character) in text[start..].char_indices() {
        if in_string {
            match character {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match character {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::fakes::{RecordingSleeper, ScriptedClient, reply};
    use super::*;

    const MINIMAL_REPLY: &str = r#"{
        "identificacion_proyecto": {"nombre_obra": "Tienda Centro", "laboratorio": "GeoLab"},
        "exploracion_campo": {"cantidad_sondeos": 3, "presencia_naf": false},
        "alternativas_cimentacion_analizadas": [
            {"tipo_cimentacion": "Zapata Aislada", "capacidad_carga_admisible_ton_m2": 14.2},
            {"tipo_cimentacion": "Losa", "capacidad_carga_admisible_ton_m2": 27.5}
        ],
        "cimentacion_recomendada": {"tipo": "Losa", "capacidad_carga_admisible_ton_m2": 27.5},
        "observaciones_criticas": null
    }"#;

    fn write_report(dir: &Path, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join("reporte.pdf");
        fs::write(&path, bytes).expect("report fixture");
        path
    }

    fn extract_with(
        client: &ScriptedClient,
        sleeper: &RecordingSleeper,
        report_path: &Path,
    ) -> ReportOutcome {
        ReportExtractor::new(client, sleeper, ReportExtractorConfig::default())
            .expect("extractor")
            .extract(report_path)
    }

    #[test]
    fn cost_uses_fixed_per_million_rates() {
        let cost = compute_cost(1000, 500);
        assert!((cost - 0.00875).abs() < 1e-12);
    }

    #[test]
    fn rate_limits_back_off_linearly_then_succeed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(vec![
            Err(ServiceError::RateLimited("slow down".to_string())),
            Err(ServiceError::RateLimited("slow down".to_string())),
            Ok(reply(MINIMAL_REPLY, 1000, 500)),
        ]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
        assert_eq!(client.calls(), 3);
        let ReportOutcome::Extracted { report, usage } = outcome else {
            panic!("expected extracted outcome, got {outcome:?}");
        };
        assert_eq!(usage.prompt_tokens, 1000);
        assert_eq!(usage.completion_tokens, 500);
        assert!((usage.cost_usd - 0.00875).abs() < 1e-12);
        assert_eq!(usage.model, "gpt-5.2");
        assert_eq!(report.alternatives.len(), 2);
    }

    #[test]
    fn exhausted_rate_limits_end_in_terminal_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(vec![
            Err(ServiceError::RateLimited(String::new())),
            Err(ServiceError::RateLimited(String::new())),
            Err(ServiceError::RateLimited(String::new())),
        ]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        assert_eq!(
            outcome,
            ReportOutcome::Failed {
                error: MAX_RETRIES_REACHED.to_string(),
                usage: None,
            }
        );
        assert_eq!(client.calls(), 3);
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
    }

    #[test]
    fn service_error_on_final_attempt_is_captured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(vec![
            Err(ServiceError::Api {
                status: 500,
                body: "boom".to_string(),
            }),
            Err(ServiceError::Transport("connection reset".to_string())),
            Err(ServiceError::Api {
                status: 503,
                body: "unavailable".to_string(),
            }),
        ]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        let ReportOutcome::Failed { error, usage } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("HTTP 503"), "unexpected error: {error}");
        assert!(usage.is_none());
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
    }

    #[test]
    fn service_error_then_success_recovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(vec![
            Err(ServiceError::InvalidBody("truncated".to_string())),
            Ok(reply(MINIMAL_REPLY, 10, 20)),
        ]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        assert!(matches!(outcome, ReportOutcome::Extracted { .. }));
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn fenced_reply_is_repaired() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let fenced = format!("Here is the extraction:\n```json\n{MINIMAL_REPLY}\n```\nDone.");
        let client = ScriptedClient::new(vec![Ok(reply(&fenced, 100, 50))]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        let ReportOutcome::Extracted { report, usage } = outcome else {
            panic!("expected repaired reply, got {outcome:?}");
        };
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(
            report.recommended.and_then(|r| r.foundation_type),
            Some(Value::String("Losa".to_string()))
        );
    }

    #[test]
    fn repair_falls_back_to_first_balanced_object() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let content = r#"{"observaciones_criticas": "uses {braces}"} trailing } noise"#;
        let client = ScriptedClient::new(vec![Ok(reply(content, 1, 1))]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        let ReportOutcome::Extracted { report, .. } = outcome else {
            panic!("expected repaired reply, got {outcome:?}");
        };
        assert_eq!(
            report.critical_observations,
            Some(Value::String("uses {braces}".to_string()))
        );
    }

    #[test]
    fn unrepairable_reply_keeps_truncated_snippet_and_usage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let raw = "x".repeat(250);
        let client = ScriptedClient::new(vec![Ok(reply(&raw, 700, 10))]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        let ReportOutcome::Failed { error, usage } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(
            error,
            format!("invalid JSON reply from model. Raw: {}...", "x".repeat(100))
        );
        assert_eq!(usage.map(|u| u.prompt_tokens), Some(700));
        assert_eq!(client.calls(), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[test]
    fn json_array_reply_is_not_accepted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(vec![Ok(reply("[1, 2, 3]", 1, 1))]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);
        assert!(matches!(outcome, ReportOutcome::Failed { .. }));
    }

    #[test]
    fn misshapen_sections_degrade_to_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let content = r#"{
            "exploracion_campo": "not reported",
            "caracterizacion_suelo": {"clasificacion_sucs": "CL", "propiedades_indice": [1, 2]},
            "alternativas_cimentacion_analizadas": {"tipo_cimentacion": "Losa"},
            "analisis_sismico": null
        }"#;
        let client = ScriptedClient::new(vec![Ok(reply(content, 1, 1))]);
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &path);

        let ReportOutcome::Extracted { report, .. } = outcome else {
            panic!("expected extraction, got {outcome:?}");
        };
        assert!(report.exploration.is_none());
        assert!(report.seismic.is_none());
        assert!(report.alternatives.is_empty());
        let soil = report.soil.expect("soil section");
        assert_eq!(soil.uscs_class, Some(Value::String("CL".to_string())));
        assert!(soil.index_properties.is_none());
    }

    #[test]
    fn interrupt_during_backoff_stops_retrying() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(vec![
            Err(ServiceError::RateLimited(String::new())),
            Ok(reply(MINIMAL_REPLY, 1, 1)),
        ]);
        let sleeper = RecordingSleeper::interrupting();

        let outcome = extract_with(&client, &sleeper, &path);

        assert_eq!(outcome, ReportOutcome::Interrupted);
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn missing_report_fails_without_calling_service() {
        let temp = tempfile::tempdir().expect("tempdir");
        let client = ScriptedClient::new(Vec::new());
        let sleeper = RecordingSleeper::default();

        let outcome = extract_with(&client, &sleeper, &temp.path().join("absent.pdf"));

        assert!(matches!(outcome, ReportOutcome::Failed { usage: None, .. }));
        assert_eq!(client.calls(), 0);
    }

    #[test]
    fn small_reports_are_attached_as_data_urls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), b"%PDF-1.4 small");
        let client = ScriptedClient::new(Vec::new());
        let sleeper = RecordingSleeper::default();
        let extractor =
            ReportExtractor::new(&client, &sleeper, ReportExtractorConfig::default()).expect("extractor");

        let payload = extractor.prepare_payload(&path).expect("payload");

        assert_eq!(
            payload,
            UserPayload::Attachment {
                filename: "reporte.pdf".to_string(),
                data_url: format!(
                    "data:application/pdf;base64,{}",
                    STANDARD.encode(b"%PDF-1.4 small")
                ),
            }
        );
    }

    #[test]
    fn transmission_mode_switches_above_threshold() {
        let threshold = DEFAULT_LARGE_FILE_THRESHOLD_BYTES;
        assert_eq!(
            TransmissionMode::for_size(threshold, threshold),
            TransmissionMode::Attachment
        );
        assert_eq!(
            TransmissionMode::for_size(threshold + 1, threshold),
            TransmissionMode::ExtractedText
        );
    }

    #[test]
    fn balanced_object_ignores_braces_in_strings() {
        let text = r#"noise {"a": "}{", "b": {"c": "\"}"}} tail }"#;
        assert_eq!(
            balanced_object(text),
            Some(r#"{"a": "}{", "b": {"c": "\"}"}}"#)
        );
        assert_eq!(balanced_object("{ unterminated"), None);
        assert_eq!(balanced_object("no braces"), None);
    }
}
