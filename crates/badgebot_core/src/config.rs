use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::classify::ActionBucket;
use crate::model::BadgeIds;

pub const DEFAULT_USER_AGENT: &str = "badgebot/0.2 (sitelink redirect badge maintenance)";
pub const DEFAULT_REPO_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_QUERY_SERVICE_URL: &str = "https://query.wikidata.org/sparql";
pub const DEFAULT_SITEMATRIX_API_URL: &str = "https://meta.wikimedia.org/w/api.php";
pub const DEFAULT_EDIT_SUMMARY_APPENDIX: &str = " #msynbotTask10";
pub const DEFAULT_REPORT_SUMMARY: &str = "update report of redirects with unconnected targets";

/// Redirect pages longer than this many bytes keep their sitelink even when the target is gone.
pub const DEFAULT_REDIRECT_LENGTH_CUTOFF: u64 = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub buckets: BucketToggles,
    #[serde(default)]
    pub badges: BadgeIds,
    #[serde(default)]
    pub endpoints: EndpointSection,
    #[serde(default)]
    pub report: ReportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunSection {
    pub simulate: bool,
    pub project_delay_ms: u64,
    pub redirect_length_cutoff: u64,
    pub edit_summary_appendix: String,
    pub only_projects: Vec<String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            simulate: true,
            project_delay_ms: 1_000,
            redirect_length_cutoff: DEFAULT_REDIRECT_LENGTH_CUTOFF,
            edit_summary_appendix: DEFAULT_EDIT_SUMMARY_APPENDIX.to_string(),
            only_projects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BucketToggles {
    pub missing_badge: bool,
    pub both_badges: bool,
    pub non_redirects: bool,
    pub inexistent_targets: bool,
    pub unconnected_targets: bool,
}

impl BucketToggles {
    pub fn enabled(&self, bucket: ActionBucket) -> bool {
        match bucket {
            ActionBucket::MissingBadge => self.missing_badge,
            ActionBucket::BothBadges => self.both_badges,
            ActionBucket::NonRedirect => self.non_redirects,
            ActionBucket::InexistentTarget => self.inexistent_targets,
            ActionBucket::UnconnectedTarget => self.unconnected_targets,
        }
    }

    pub fn set(&mut self, bucket: ActionBucket, value: bool) {
        match bucket {
            ActionBucket::MissingBadge => self.missing_badge = value,
            ActionBucket::BothBadges => self.both_badges = value,
            ActionBucket::NonRedirect => self.non_redirects = value,
            ActionBucket::InexistentTarget => self.inexistent_targets = value,
            ActionBucket::UnconnectedTarget => self.unconnected_targets = value,
        }
    }

    pub fn enable_all(&mut self) {
        for bucket in ActionBucket::ALL {
            self.set(bucket, true);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointSection {
    pub repo_api_url: String,
    pub query_service_url: String,
    pub sitematrix_api_url: String,
    pub user_agent: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            repo_api_url: DEFAULT_REPO_API_URL.to_string(),
            query_service_url: DEFAULT_QUERY_SERVICE_URL.to_string(),
            sitematrix_api_url: DEFAULT_SITEMATRIX_API_URL.to_string(),
            user_agent: None,
            timeout_ms: 30_000,
            rate_limit_read_ms: 300,
            rate_limit_write_ms: 1_000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl EndpointSection {
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportSection {
    /// Wiki page the finished table is saved to; unset keeps the report local.
    pub page: Option<String>,
    pub summary: String,
    /// Project family to short interwiki prefix, merged over the built-in table.
    pub prefixes: BTreeMap<String, String>,
    /// Database name to interwiki prefix for sites outside the language families.
    pub site_prefixes: BTreeMap<String, String>,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            page: None,
            summary: DEFAULT_REPORT_SUMMARY.to_string(),
            prefixes: BTreeMap::new(),
            site_prefixes: BTreeMap::new(),
        }
    }
}

/// The slice of configuration the reconciler is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub simulate: bool,
    pub redirect_length_cutoff: u64,
    pub edit_summary_appendix: String,
    pub badges: BadgeIds,
}

impl BotConfig {
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            simulate: self.run.simulate,
            redirect_length_cutoff: self.run.redirect_length_cutoff,
            edit_summary_appendix: self.run.edit_summary_appendix.clone(),
            badges: self.badges.clone(),
        }
    }

    /// Apply process environment overrides: env > config file > defaults.
    pub fn with_process_env(self) -> Self {
        self.with_env_overrides(|key| env::var(key).ok())
    }

    pub fn with_env_overrides<F>(mut self, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = lookup("BADGEBOT_SIMULATE").and_then(|value| parse_flag(&value)) {
            self.run.simulate = value;
        }
        if let Some(value) =
            lookup("BADGEBOT_PROJECT_DELAY_MS").and_then(|value| value.parse::<u64>().ok())
        {
            self.run.project_delay_ms = value;
        }
        if let Some(value) = lookup("BADGEBOT_REPO_API_URL") {
            self.endpoints.repo_api_url = value;
        }
        if let Some(value) = lookup("BADGEBOT_QUERY_SERVICE_URL") {
            self.endpoints.query_service_url = value;
        }
        if let Some(value) = lookup("BADGEBOT_USER_AGENT") {
            self.endpoints.user_agent = Some(value);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let a = self.badges.sitelink_to_redirect.trim();
        let b = self.badges.intentional_sitelink_to_redirect.trim();
        for (key, value) in [
            ("badges.sitelink_to_redirect", a),
            ("badges.intentional_sitelink_to_redirect", b),
        ] {
            if !is_item_id(value) {
                bail!("{key} must be an item identifier like Q123, got `{value}`");
            }
        }
        if a == b {
            bail!("the two redirect badges must be different items (both are {a})");
        }
        for (key, value) in [
            ("endpoints.repo_api_url", &self.endpoints.repo_api_url),
            ("endpoints.query_service_url", &self.endpoints.query_service_url),
            ("endpoints.sitematrix_api_url", &self.endpoints.sitematrix_api_url),
        ] {
            if value.trim().is_empty() {
                bail!("{key} cannot be empty");
            }
        }
        if let Some(page) = &self.report.page
            && page.trim().is_empty()
        {
            bail!("report.page cannot be empty when set");
        }
        Ok(())
    }
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Default configuration rendered as TOML, as written by `badgebot init`.
pub fn render_default_config() -> Result<String> {
    let body = toml::to_string_pretty(&BotConfig::default())
        .context("failed to serialize default config TOML")?;
    Ok(format!(
        "# badgebot configuration (materialized by `badgebot init`)\n# simulate = true logs every decision without writing to the repository.\n# [report.prefixes] entries extend the built-in family prefix table.\n\n{body}"
    ))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn is_item_id(value: &str) -> bool {
    value
        .strip_prefix('Q')
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn default_config_simulates_with_all_buckets_off() {
        let config = BotConfig::default();
        assert!(config.run.simulate);
        assert_eq!(config.run.redirect_length_cutoff, 100);
        for bucket in ActionBucket::ALL {
            assert!(!config.buckets.enabled(bucket));
        }
        assert_eq!(config.badges.sitelink_to_redirect, "Q70893996");
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, BotConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[run]
simulate = false
redirect_length_cutoff = 250
only_projects = ["dewiki", "enwiki"]

[buckets]
missing_badge = true
inexistent_targets = true

[endpoints]
user_agent = "test-agent/1.0"

[report]
page = "User:Example/Unconnected redirect targets"

[report.prefixes]
wikipedia = "wp"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(!config.run.simulate);
        assert_eq!(config.run.redirect_length_cutoff, 250);
        assert_eq!(config.run.project_delay_ms, 1_000);
        assert_eq!(config.run.only_projects, vec!["dewiki", "enwiki"]);
        assert!(config.buckets.enabled(ActionBucket::MissingBadge));
        assert!(config.buckets.enabled(ActionBucket::InexistentTarget));
        assert!(!config.buckets.enabled(ActionBucket::BothBadges));
        assert_eq!(config.endpoints.user_agent(), "test-agent/1.0");
        assert_eq!(config.endpoints.repo_api_url, DEFAULT_REPO_API_URL);
        assert_eq!(
            config.report.prefixes.get("wikipedia").map(String::as_str),
            Some("wp")
        );
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[run\nsimulate = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env = HashMap::from([
            ("BADGEBOT_SIMULATE".to_string(), "no".to_string()),
            ("BADGEBOT_USER_AGENT".to_string(), " bot/2.0 ".to_string()),
            ("BADGEBOT_REPO_API_URL".to_string(), "   ".to_string()),
        ]);
        let config = BotConfig::default().with_env_overrides(|key| env.get(key).cloned());
        assert!(!config.run.simulate);
        assert_eq!(config.endpoints.user_agent(), "bot/2.0");
        assert_eq!(config.endpoints.repo_api_url, DEFAULT_REPO_API_URL);
    }

    #[test]
    fn unparseable_simulate_flag_is_ignored() {
        let config = BotConfig::default().with_env_overrides(|key| {
            (key == "BADGEBOT_SIMULATE").then(|| "maybe".to_string())
        });
        assert!(config.run.simulate);
    }

    #[test]
    fn validate_rejects_identical_badges() {
        let mut config = BotConfig::default();
        config.badges.intentional_sitelink_to_redirect = config.badges.sitelink_to_redirect.clone();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("must be different"));
    }

    #[test]
    fn validate_rejects_malformed_badge() {
        let mut config = BotConfig::default();
        config.badges.sitelink_to_redirect = "redirect".to_string();
        assert!(config.validate().is_err());
        assert!(BotConfig::default().validate().is_ok());
    }

    #[test]
    fn rendered_default_config_parses_back() {
        let rendered = render_default_config().expect("render");
        let parsed: BotConfig = toml::from_str(&rendered).expect("parse rendered");
        assert_eq!(parsed, BotConfig::default());
    }

    #[test]
    fn bucket_toggles_enable_all() {
        let mut toggles = BucketToggles::default();
        toggles.enable_all();
        assert!(ActionBucket::ALL.into_iter().all(|bucket| toggles.enabled(bucket)));
    }

    #[test]
    fn reconcile_policy_copies_run_settings() {
        let policy = BotConfig::default().reconcile_policy();
        assert!(policy.simulate);
        assert_eq!(policy.redirect_length_cutoff, 100);
        assert_eq!(policy.edit_summary_appendix, " #msynbotTask10");
    }
}
