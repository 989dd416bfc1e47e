//! Run configuration: YAML model, environment substitution and validation.
//!
//! A run file names a store, a list of templates (what the documents look
//! like) and a list of workloads (what to do with them). Spec-valued fields
//! (template bodies, filters, variables) stay as raw YAML here and are
//! converted to BSON when templates and workloads are built.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Operations a workload can run.
pub const KNOWN_OPS: &[&str] = &[
    "insert",
    "find",
    "updateOne",
    "updateMany",
    "deleteOne",
    "deleteMany",
    "replaceOne",
    "replaceWithNew",
    "aggregate",
    "timeseries",
    "bucketTimeseries",
    "custom",
];

/// Operations that accept `batch > 0`.
const BATCH_OPS: &[&str] = &[
    "insert",
    "updateOne",
    "updateMany",
    "replaceWithNew",
    "timeseries",
    "bucketTimeseries",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub connection_string: String,

    /// Reporting tick interval in milliseconds.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,

    /// Duration percentiles included in every report.
    #[serde(default = "default_report_percentiles")]
    pub report_percentiles: Vec<f64>,

    /// Optional persistent report sink.
    #[serde(default)]
    pub mongo_reporter: Option<MongoReporterConfig>,

    /// Accepted for compatibility; the report query surface is exposed
    /// programmatically, no server is started.
    #[serde(default)]
    pub http: Option<HttpConfig>,

    pub templates: Vec<TemplateConfig>,
    pub workloads: Vec<WorkloadConfig>,
}

fn default_report_interval() -> u64 {
    1000
}

fn default_report_percentiles() -> Vec<f64> {
    vec![95.0]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoReporterConfig {
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    pub name: String,
    pub database: String,
    pub collection: String,

    #[serde(default)]
    pub drop: bool,

    /// When set, the template fans out into `name_0..name_N-1`, each bound
    /// to an equally suffixed collection.
    #[serde(default)]
    pub instances: Option<u32>,

    pub template: serde_yaml::Value,

    #[serde(default)]
    pub variables: Option<serde_yaml::Value>,

    #[serde(default)]
    pub remember: Vec<serde_yaml::Value>,

    #[serde(default)]
    pub dictionaries: BTreeMap<String, DictionaryConfig>,

    /// Index key documents created at initialization.
    #[serde(default)]
    pub indexes: Vec<serde_yaml::Value>,

    #[serde(default)]
    pub create_options: Option<CreateOptionsConfig>,
}

/// A dictionary is either an inline list of values or a loaded source.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DictionaryConfig {
    Inline(Vec<serde_yaml::Value>),
    Source(DictionarySource),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionarySource {
    /// `text` (default), `json` or `collection`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    /// File path for `text` and `json` sources.
    #[serde(default)]
    pub file: Option<String>,

    /// Database of a `collection` source; defaults to the template's.
    #[serde(default)]
    pub db: Option<String>,

    #[serde(default)]
    pub collection: Option<String>,

    /// Filter spec of a `collection` source, compiled like any template.
    #[serde(default)]
    pub query: Option<serde_yaml::Value>,

    #[serde(default)]
    pub limit: Option<usize>,

    /// Projected attribute of a `collection` source; defaults to `_id`.
    #[serde(default)]
    pub attribute: Option<String>,
}

impl DictionarySource {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("text")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptionsConfig {
    #[serde(default)]
    pub capped: bool,

    /// Capped collection size in bytes.
    #[serde(default)]
    pub size: Option<u64>,

    #[serde(default)]
    pub timeseries: Option<TimeseriesOptionsConfig>,

    #[serde(default)]
    pub expire_after_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesOptionsConfig {
    pub time_field: String,
    #[serde(default)]
    pub meta_field: Option<String>,
    /// `seconds`, `minutes` or `hours`.
    #[serde(default)]
    pub granularity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    pub name: String,

    /// Base name of the bound template.
    pub template: String,

    pub op: String,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub params: Option<serde_yaml::Value>,

    #[serde(default)]
    pub variables: Option<serde_yaml::Value>,

    #[serde(default)]
    pub variables_scope: VariablesScope,

    #[serde(default = "default_threads")]
    pub threads: u32,

    /// `0` means single-document operations.
    #[serde(default)]
    pub batch: u32,

    /// Minimum milliseconds between iteration starts; `0` disables pacing.
    #[serde(default)]
    pub pace: u64,

    /// Milliseconds each worker waits before its first iteration.
    #[serde(default)]
    pub start_delay: u64,

    #[serde(default)]
    pub stop_after: Option<StopAfter>,
}

fn default_threads() -> u32 {
    1
}

/// Granularity of the generated variable scope: once per iteration, or
/// refreshed around every single operation inside a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariablesScope {
    #[default]
    Iteration,
    Operation,
}

/// Stop condition: a bare number of iterations, or a document with
/// `iterations` and/or `duration` (milliseconds).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum StopAfter {
    Iterations(u64),
    Detailed {
        #[serde(default)]
        iterations: Option<u64>,
        #[serde(default)]
        duration: Option<u64>,
    },
}

impl StopAfter {
    pub fn iterations(&self) -> Option<u64> {
        match self {
            StopAfter::Iterations(n) => Some(*n),
            StopAfter::Detailed { iterations, .. } => *iterations,
        }
    }

    pub fn duration_millis(&self) -> Option<u64> {
        match self {
            StopAfter::Iterations(_) => None,
            StopAfter::Detailed { duration, .. } => *duration,
        }
    }
}

impl RunConfig {
    /// Parse a run file that has already gone through
    /// [`substitute_env_vars`].
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: RunConfig =
            serde_yaml::from_str(raw).context("cannot parse run configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast structural validation; everything reported here would
    /// otherwise only surface mid-run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_string.is_empty() {
            bail!("connectionString must not be empty");
        }
        if self.report_interval == 0 {
            bail!("reportInterval must be positive");
        }
        for p in &self.report_percentiles {
            if !(*p > 0.0 && *p <= 100.0) {
                bail!("report percentile {p} is outside (0, 100]");
            }
        }

        if self.templates.is_empty() {
            bail!("at least one template is required");
        }
        let mut template_names = std::collections::BTreeSet::new();
        for template in &self.templates {
            if !template_names.insert(template.name.as_str()) {
                bail!("duplicate template name '{}'", template.name);
            }
            if let Some(0) = template.instances {
                bail!("template '{}': instances must be positive", template.name);
            }
            if !template.template.is_mapping() {
                bail!("template '{}': the template spec must be a mapping", template.name);
            }
        }

        let mut workload_names = std::collections::BTreeSet::new();
        for workload in &self.workloads {
            if !workload_names.insert(workload.name.as_str()) {
                bail!("duplicate workload name '{}'", workload.name);
            }
            if !template_names.contains(workload.template.as_str()) {
                bail!(
                    "workload '{}' references unknown template '{}'",
                    workload.name,
                    workload.template
                );
            }
            if !KNOWN_OPS.contains(&workload.op.as_str()) {
                bail!("workload '{}': unknown op '{}'", workload.name, workload.op);
            }
            if workload.threads == 0 {
                bail!("workload '{}': threads must be positive", workload.name);
            }
            if workload.batch > 0 && !BATCH_OPS.contains(&workload.op.as_str()) {
                bail!(
                    "workload '{}': op '{}' does not support batching",
                    workload.name,
                    workload.op
                );
            }
            if let Some(stop) = &workload.stop_after {
                if stop.iterations().is_none() && stop.duration_millis().is_none() {
                    bail!(
                        "workload '{}': stopAfter needs iterations and/or duration",
                        workload.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Whether every enabled workload eventually stops on its own.
    pub fn all_workloads_bounded(&self) -> bool {
        self.workloads
            .iter()
            .filter(|w| !w.disabled)
            .all(|w| w.stop_after.is_some())
    }
}

/// Replace `${NAME}` occurrences with the value of the environment variable
/// `NAME`, applied to the raw configuration text before parsing. Unset
/// variables are left in place with a warning.
pub fn substitute_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if after[..end].chars().all(is_env_var_char) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        warn!("environment variable {name} is not set, leaving ${{{name}}} as-is");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_env_var_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
connectionString: memory://
templates:
  - name: people
    database: test
    collection: people
    template:
      first: { "%name.firstName": {} }
workloads:
  - name: insert people
    template: people
    op: insert
    threads: 2
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = RunConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.report_interval, 1000);
        assert_eq!(config.report_percentiles, vec![95.0]);
        assert_eq!(config.workloads[0].threads, 2);
        assert_eq!(config.workloads[0].batch, 0);
        assert_eq!(config.workloads[0].variables_scope, VariablesScope::Iteration);
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let raw = MINIMAL.replace("op: insert", "op: upsertAll");
        let err = RunConfig::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown op"));
    }

    #[test]
    fn test_batch_rejected_for_find() {
        let raw = MINIMAL.replace("op: insert", "op: find\n    batch: 10");
        let err = RunConfig::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("does not support batching"));
    }

    #[test]
    fn test_unknown_template_reference_is_rejected() {
        let raw = MINIMAL.replace("template: people", "template: nobody");
        let err = RunConfig::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown template"));
    }

    #[test]
    fn test_stop_after_forms() {
        let raw = format!("{MINIMAL}    stopAfter: 100\n");
        let config = RunConfig::parse(&raw).unwrap();
        let stop = config.workloads[0].stop_after.unwrap();
        assert_eq!(stop.iterations(), Some(100));
        assert_eq!(stop.duration_millis(), None);

        let raw = format!("{MINIMAL}    stopAfter: {{ duration: 5000 }}\n");
        let config = RunConfig::parse(&raw).unwrap();
        let stop = config.workloads[0].stop_after.unwrap();
        assert_eq!(stop.iterations(), None);
        assert_eq!(stop.duration_millis(), Some(5000));
        assert!(config.all_workloads_bounded());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("SIMRUNNER_TEST_URI", "memory://local");
        let out = substitute_env_vars("uri: ${SIMRUNNER_TEST_URI} rest");
        assert_eq!(out, "uri: memory://local rest");

        let out = substitute_env_vars("uri: ${SIMRUNNER_UNSET_VAR_12345}");
        assert_eq!(out, "uri: ${SIMRUNNER_UNSET_VAR_12345}");

        let out = substitute_env_vars("no variables here");
        assert_eq!(out, "no variables here");
    }
}
