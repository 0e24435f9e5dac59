use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the timing pipeline.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// Clock correlation and statistics configuration.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Chrome trace sink configuration.
    #[serde(default)]
    pub chrome_trace: ChromeTraceConfig,

    /// Instrumentation task sink configuration.
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,

    /// Timing report output configuration.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Clock correlation and statistics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Largest accepted distance between the profiling-derived queued time
    /// and the issue-time host reading. Default: 1s.
    #[serde(default = "default_drift_threshold", with = "humantime_serde")]
    pub drift_threshold: Duration,

    /// Log one line per completed device sample. Default: false.
    #[serde(default)]
    pub device_timeline_logging: bool,

    /// Include host call timing in the report. Default: true.
    #[serde(default = "default_true")]
    pub host_report: bool,

    /// Include per-device timing in the report. Default: true.
    #[serde(default = "default_true")]
    pub device_report: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            device_timeline_logging: false,
            host_report: true,
            device_report: true,
        }
    }
}

impl TimingConfig {
    /// Drift threshold in nanoseconds, saturating.
    pub fn drift_threshold_ns(&self) -> u64 {
        u64::try_from(self.drift_threshold.as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Chrome trace sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChromeTraceConfig {
    /// Enable the Chrome trace sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Output file written on finish. Default: "cltiming_trace.json".
    #[serde(default = "default_trace_file")]
    pub file: PathBuf,

    /// One track per kernel name instead of one per queue. Default: false.
    #[serde(default)]
    pub per_kernel: bool,

    /// Emit queued, submitted and execution stages as separate events.
    /// Default: false.
    #[serde(default)]
    pub in_stages: bool,

    /// Process name shown in the trace viewer. Default: executable name.
    #[serde(default)]
    pub process_name: Option<String>,
}

impl Default for ChromeTraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: default_trace_file(),
            per_kernel: false,
            in_stages: false,
            process_name: None,
        }
    }
}

/// Instrumentation task sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentationConfig {
    /// Enable the instrumentation sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Domain the tasks are reported under. Default: "cltiming".
    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: default_domain(),
        }
    }
}

/// Timing report output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Write the report to stderr. Default: true.
    #[serde(default = "default_true")]
    pub to_stderr: bool,

    /// Also write the report to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            to_stderr: true,
            file: None,
        }
    }
}

// --- Default value functions ---

fn default_drift_threshold() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_trace_file() -> PathBuf {
    PathBuf::from("cltiming_trace.json")
}

fn default_domain() -> String {
    "cltiming".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.timing.drift_threshold.is_zero() {
            bail!("timing.drift_threshold must be positive");
        }

        if self.chrome_trace.enabled && self.chrome_trace.file.as_os_str().is_empty() {
            bail!("chrome_trace.file is required when chrome_trace.enabled is true");
        }

        if self.instrumentation.enabled && self.instrumentation.domain.is_empty() {
            bail!("instrumentation.domain is required when instrumentation.enabled is true");
        }

        if let Some(file) = &self.report.file {
            if file.as_os_str().is_empty() {
                bail!("report.file must not be empty");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.timing.drift_threshold, Duration::from_secs(1));
        assert_eq!(cfg.timing.drift_threshold_ns(), 1_000_000_000);
        assert!(!cfg.timing.device_timeline_logging);
        assert!(cfg.timing.host_report);
        assert!(cfg.timing.device_report);
        assert!(!cfg.chrome_trace.enabled);
        assert_eq!(cfg.chrome_trace.file, PathBuf::from("cltiming_trace.json"));
        assert!(!cfg.instrumentation.enabled);
        assert_eq!(cfg.instrumentation.domain, "cltiming");
        assert!(cfg.report.to_stderr);
        assert!(cfg.report.file.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg = Config::from_yaml("{}").expect("parse");
        assert_eq!(cfg.timing.drift_threshold, Duration::from_secs(1));
        assert!(cfg.report.to_stderr);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
timing:
  drift_threshold: 250ms
  device_timeline_logging: true
  host_report: false
chrome_trace:
  enabled: true
  file: /tmp/trace.json
  per_kernel: true
  in_stages: true
  process_name: bench
instrumentation:
  enabled: true
  domain: gpu
report:
  to_stderr: false
  file: /tmp/report.txt
"#;
        let cfg = Config::from_yaml(yaml).expect("parse");

        assert_eq!(cfg.timing.drift_threshold, Duration::from_millis(250));
        assert_eq!(cfg.timing.drift_threshold_ns(), 250_000_000);
        assert!(cfg.timing.device_timeline_logging);
        assert!(!cfg.timing.host_report);
        assert!(cfg.timing.device_report);

        assert!(cfg.chrome_trace.enabled);
        assert_eq!(cfg.chrome_trace.file, PathBuf::from("/tmp/trace.json"));
        assert!(cfg.chrome_trace.per_kernel);
        assert!(cfg.chrome_trace.in_stages);
        assert_eq!(cfg.chrome_trace.process_name.as_deref(), Some("bench"));

        assert!(cfg.instrumentation.enabled);
        assert_eq!(cfg.instrumentation.domain, "gpu");

        assert!(!cfg.report.to_stderr);
        assert_eq!(cfg.report.file, Some(PathBuf::from("/tmp/report.txt")));
    }

    #[test]
    fn test_zero_drift_threshold_rejected() {
        let err = Config::from_yaml("timing:\n  drift_threshold: 0s\n").expect_err("invalid");
        assert!(err.to_string().contains("drift_threshold"));
    }

    #[test]
    fn test_enabled_trace_requires_file() {
        let err = Config::from_yaml("chrome_trace:\n  enabled: true\n  file: \"\"\n")
            .expect_err("invalid");
        assert!(err.to_string().contains("chrome_trace.file"));

        // Disabled sinks are not checked.
        assert!(Config::from_yaml("chrome_trace:\n  file: \"\"\n").is_ok());
    }

    #[test]
    fn test_enabled_instrumentation_requires_domain() {
        let err = Config::from_yaml("instrumentation:\n  enabled: true\n  domain: \"\"\n")
            .expect_err("invalid");
        assert!(err.to_string().contains("instrumentation.domain"));
    }

    #[test]
    fn test_empty_report_file_rejected() {
        assert!(Config::from_yaml("report:\n  file: \"\"\n").is_err());
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(Config::from_yaml("timing:\n  drift_threshold: soon\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "timing:\n  drift_threshold: 2s").expect("write");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.timing.drift_threshold, Duration::from_secs(2));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/cltiming.yaml")).expect_err("missing");
        assert!(format!("{err:#}").contains("reading config file"));
    }
}
