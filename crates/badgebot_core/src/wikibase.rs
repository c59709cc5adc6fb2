//! Blocking MediaWiki/Wikibase client backing every remote collaborator trait.
//!
//! Repository calls (entities, sitelinks, report page) go to the configured repository
//! API, page checks go to the client wiki's own API, and site identities come from the
//! site matrix. API error codes are mapped onto [`RemoteError`] here and nowhere else.

use std::collections::{BTreeMap, BTreeSet};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::EndpointSection;
use crate::model::{NamespaceNames, ProjectDescriptor, SiteIdentity};
use crate::remote::{
    CacheRefresh, Entity, EntityLookup, EntityStore, PageInspector, RedirectTarget,
    RefreshTarget, RemoteError, ReportPublisher, SiteMetadata, Sitelink,
};

#[derive(Debug, Clone)]
pub struct WikibaseClientConfig {
    pub repo_api_url: String,
    pub sitematrix_api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl WikibaseClientConfig {
    pub fn from_endpoints(endpoints: &EndpointSection) -> Self {
        Self {
            repo_api_url: endpoints.repo_api_url.clone(),
            sitematrix_api_url: endpoints.sitematrix_api_url.clone(),
            user_agent: endpoints.user_agent(),
            timeout_ms: endpoints.timeout_ms,
            rate_limit_read_ms: endpoints.rate_limit_read_ms,
            rate_limit_write_ms: endpoints.rate_limit_write_ms,
            max_retries: endpoints.max_retries,
            max_write_retries: endpoints.max_retries.min(1),
            retry_delay_ms: endpoints.retry_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestMode {
    Read,
    ReadPost,
    Write,
}

pub struct WikibaseClient {
    client: Client,
    config: WikibaseClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    client_apis: BTreeMap<String, String>,
    site_matrix: Option<BTreeMap<String, SiteIdentity>>,
}

impl WikibaseClient {
    pub fn new(config: WikibaseClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            client_apis: BTreeMap::new(),
            site_matrix: None,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// Makes a client wiki reachable under its database name.
    pub fn register_project(&mut self, project: &ProjectDescriptor) {
        self.client_apis
            .insert(project.db_name.clone(), project.api_url());
    }

    /// Logs in to the repository with a bot password.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let repo = self.config.repo_api_url.clone();
        let token_response = self
            .request(
                &repo,
                &[
                    ("action", "query".to_string()),
                    ("meta", "tokens".to_string()),
                    ("type", "login".to_string()),
                ],
                RequestMode::Read,
            )
            .context("failed to request login token")?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self
            .request(
                &repo,
                &[
                    ("action", "login".to_string()),
                    ("lgname", username.to_string()),
                    ("lgpassword", password.to_string()),
                    ("lgtoken", login_token),
                ],
                RequestMode::Write,
            )
            .context("failed to log in")?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn client_api(&self, site: &str) -> Result<String, RemoteError> {
        self.client_apis
            .get(site)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownSite(site.to_string()))
    }

    fn request(
        &mut self,
        api_url: &str,
        params: &[(&str, String)],
        mode: RequestMode,
    ) -> Result<Value, RemoteError> {
        let base_url = Url::parse(api_url).map_err(|error| RemoteError::MalformedRequest {
            code: "invalid-url".to_string(),
            info: format!("{api_url}: {error}"),
        })?;
        let max_retries = match mode {
            RequestMode::Write => self.config.max_write_retries,
            RequestMode::Read | RequestMode::ReadPost => self.config.max_retries,
        };

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            pairs.push(((*key).to_string(), value.clone()));
        }

        for attempt in 0..=max_retries {
            self.apply_rate_limit(mode == RequestMode::Write);
            let request = match mode {
                RequestMode::Read => self.client.get(base_url.clone()).query(&pairs),
                RequestMode::ReadPost | RequestMode::Write => {
                    self.client.post(base_url.clone()).form(&pairs)
                }
            };
            let response = request
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, mode == RequestMode::Write);
                            continue;
                        }
                        return Err(RemoteError::Transport(format!(
                            "{api_url} answered HTTP {status}"
                        )));
                    }

                    let payload: Value = response.json().map_err(|error| {
                        RemoteError::Transport(format!("undecodable API response: {error}"))
                    })?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        return Err(classify_api_error(code, info));
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, mode == RequestMode::Write);
                        continue;
                    }
                    return Err(RemoteError::Transport(error.to_string()));
                }
            }
        }

        Err(RemoteError::Transport(
            "MediaWiki API request exhausted retry budget".to_string(),
        ))
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String, RemoteError> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let repo = self.config.repo_api_url.clone();
        let response = self.request(
            &repo,
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
            ],
            RequestMode::Read,
        )?;
        let parsed: TokenQueryResponse = serde_json::from_value(response)
            .map_err(|error| RemoteError::Transport(format!("bad token response: {error}")))?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .filter(|token| token != "+\\")
            .ok_or_else(|| RemoteError::Authentication("no csrf token; not logged in".to_string()))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn set_sitelink(
        &mut self,
        entity: &Entity,
        site: &str,
        mut params: Vec<(&'static str, String)>,
        summary: &str,
    ) -> Result<(), RemoteError> {
        let token = self.ensure_csrf_token()?;
        params.extend([
            ("action", "wbsetsitelink".to_string()),
            ("id", entity.id.clone()),
            ("linksite", site.to_string()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
        ]);
        if let Some(revision) = entity.revision {
            params.push(("baserevid", revision.to_string()));
        }
        params.push(("token", token));

        let repo = self.config.repo_api_url.clone();
        let response = self.request(&repo, &params, RequestMode::Write)?;
        if response.get("success").and_then(Value::as_i64) == Some(1)
            || response.get("success").and_then(Value::as_bool) == Some(true)
        {
            return Ok(());
        }
        Err(RemoteError::Rejected {
            code: "no-success".to_string(),
            info: format!("wbsetsitelink on {} did not report success", entity.id),
        })
    }

    fn write_badges(
        &mut self,
        entity: &Entity,
        site: &str,
        badges: BTreeSet<String>,
        summary: &str,
    ) -> Result<(), RemoteError> {
        let sitelink = entity.sitelink(site).ok_or_else(|| RemoteError::PageMissing {
            site: site.to_string(),
            title: format!("sitelink of {}", entity.id),
        })?;
        // The current title keeps the link in place when the badge list ends up empty.
        let params = vec![
            ("linktitle", sitelink.title.clone()),
            ("badges", badges.into_iter().collect::<Vec<_>>().join("|")),
        ];
        self.set_sitelink(entity, site, params, summary)
    }

    fn page_info(&mut self, site: &str, title: &str) -> Result<PageInfo, RemoteError> {
        let api = self.client_api(site)?;
        let response = self.request(
            &api,
            &[
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("prop", "info|pageprops".to_string()),
                ("ppprop", "wikibase_item".to_string()),
            ],
            RequestMode::Read,
        )?;
        let parsed: PageQueryResponse = serde_json::from_value(response)
            .map_err(|error| RemoteError::Transport(format!("bad page info response: {error}")))?;
        let page = parsed.query.pages.into_iter().next().ok_or_else(|| {
            RemoteError::PageMissing {
                site: site.to_string(),
                title: title.to_string(),
            }
        })?;
        if page.missing || page.invalid {
            return Err(RemoteError::PageMissing {
                site: site.to_string(),
                title: title.to_string(),
            });
        }
        Ok(page)
    }

    fn load_site_matrix(&mut self) -> Result<&BTreeMap<String, SiteIdentity>, RemoteError> {
        if self.site_matrix.is_none() {
            let meta = self.config.sitematrix_api_url.clone();
            let response = self.request(
                &meta,
                &[
                    ("action", "sitematrix".to_string()),
                    ("smlimit", "max".to_string()),
                ],
                RequestMode::Read,
            )?;
            let matrix = parse_site_matrix(&response);
            debug!(sites = matrix.len(), "loaded site matrix");
            self.site_matrix = Some(matrix);
        }
        self.site_matrix
            .as_ref()
            .ok_or_else(|| RemoteError::Transport("site matrix unavailable".to_string()))
    }
}

impl EntityStore for WikibaseClient {
    fn resolve(&mut self, identifier: &str) -> Result<EntityLookup, RemoteError> {
        let repo = self.config.repo_api_url.clone();
        let response = self.request(
            &repo,
            &[
                ("action", "wbgetentities".to_string()),
                ("ids", identifier.to_string()),
                ("props", "info|sitelinks".to_string()),
            ],
            RequestMode::Read,
        );
        match response {
            Ok(payload) => parse_entity_lookup(identifier, &payload),
            Err(RemoteError::NoSuchEntity(_)) => Ok(EntityLookup::Missing),
            Err(error) => Err(error),
        }
    }

    fn grant_badge(
        &mut self,
        entity: &Entity,
        site: &str,
        badge: &str,
        summary: &str,
    ) -> Result<(), RemoteError> {
        let mut badges = entity
            .sitelink(site)
            .map(|sitelink| sitelink.badges.clone())
            .unwrap_or_default();
        badges.insert(badge.to_string());
        self.write_badges(entity, site, badges, summary)
    }

    fn revoke_badge(
        &mut self,
        entity: &Entity,
        site: &str,
        badge: &str,
        summary: &str,
    ) -> Result<(), RemoteError> {
        let mut badges = entity
            .sitelink(site)
            .map(|sitelink| sitelink.badges.clone())
            .unwrap_or_default();
        badges.remove(badge);
        self.write_badges(entity, site, badges, summary)
    }

    fn remove_sitelink(
        &mut self,
        entity: &Entity,
        site: &str,
        summary: &str,
    ) -> Result<(), RemoteError> {
        self.set_sitelink(entity, site, Vec::new(), summary)
    }
}

impl PageInspector for WikibaseClient {
    fn is_redirect(&mut self, site: &str, title: &str) -> Result<bool, RemoteError> {
        Ok(self.page_info(site, title)?.redirect)
    }

    fn redirect_target(&mut self, site: &str, title: &str) -> Result<RedirectTarget, RemoteError> {
        let api = self.client_api(site)?;
        let response = self.request(
            &api,
            &[
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("redirects", "1".to_string()),
                ("prop", "info".to_string()),
            ],
            RequestMode::Read,
        )?;
        let parsed: PageQueryResponse = serde_json::from_value(response)
            .map_err(|error| RemoteError::Transport(format!("bad redirect response: {error}")))?;
        resolve_redirect_chain(site, title, &parsed.query)
    }

    fn content_length(&mut self, site: &str, title: &str) -> Result<u64, RemoteError> {
        Ok(self.page_info(site, title)?.length.unwrap_or(0))
    }

    fn target_entity(&mut self, site: &str, title: &str) -> Result<Option<String>, RemoteError> {
        match self.page_info(site, title) {
            Ok(page) => Ok(page.pageprops.and_then(|props| props.wikibase_item)),
            Err(RemoteError::PageMissing { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl CacheRefresh for WikibaseClient {
    fn request_refresh(&mut self, site: &str, target: &RefreshTarget) -> Result<(), RemoteError> {
        let api = self.client_api(site)?;
        let selector = match target {
            RefreshTarget::PageId(page_id) => ("pageids", page_id.to_string()),
            RefreshTarget::Title(title) => ("titles", title.clone()),
        };
        self.request(
            &api,
            &[
                ("action", "purge".to_string()),
                ("forcelinkupdate", "1".to_string()),
                selector,
            ],
            RequestMode::ReadPost,
        )?;
        Ok(())
    }
}

impl SiteMetadata for WikibaseClient {
    fn namespace_names(
        &mut self,
        project: &ProjectDescriptor,
    ) -> Result<BTreeMap<i32, NamespaceNames>, RemoteError> {
        let api = project.api_url();
        let response = self.request(
            &api,
            &[
                ("action", "query".to_string()),
                ("meta", "siteinfo".to_string()),
                ("siprop", "namespaces".to_string()),
            ],
            RequestMode::Read,
        )?;
        Ok(parse_namespaces(&response))
    }

    fn site_identity(&mut self, db_name: &str) -> Result<SiteIdentity, RemoteError> {
        self.load_site_matrix()?
            .get(db_name)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownSite(db_name.to_string()))
    }
}

impl ReportPublisher for WikibaseClient {
    fn publish(&mut self, page: &str, content: &str, summary: &str) -> Result<(), RemoteError> {
        let token = self.ensure_csrf_token()?;
        let repo = self.config.repo_api_url.clone();
        let response = self.request(
            &repo,
            &[
                ("action", "edit".to_string()),
                ("title", page.to_string()),
                ("text", content.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("token", token),
            ],
            RequestMode::Write,
        )?;
        let edit_payload: EditResponse = serde_json::from_value(response)
            .map_err(|error| RemoteError::Transport(format!("bad edit response: {error}")))?;
        match edit_payload.edit.and_then(|edit| edit.result).as_deref() {
            Some("Success") => Ok(()),
            other => Err(RemoteError::Rejected {
                code: "edit-failed".to_string(),
                info: format!("edit of {page} returned {}", other.unwrap_or("nothing")),
            }),
        }
    }
}

/// Maps a MediaWiki/Wikibase API error code onto the remote error taxonomy.
pub fn classify_api_error(code: &str, info: &str) -> RemoteError {
    match code {
        "no-such-entity" => RemoteError::NoSuchEntity(info.to_string()),
        "editconflict" => RemoteError::EditConflict(info.to_string()),
        "no-external-page" | "missingtitle" => RemoteError::PageMissing {
            site: String::new(),
            title: info.to_string(),
        },
        "not-badge" | "invalid-badge" => RemoteError::InvalidBadge(info.to_string()),
        "badvalue" | "paramvalidationfailed" | "invalid-entity-id" | "missingparam"
        | "param-missing" | "param-illegal" | "unknown_action" | "badinteger" => {
            RemoteError::MalformedRequest {
                code: code.to_string(),
                info: info.to_string(),
            }
        }
        "unknown-site" | "unknown_linksite" | "unknown-linksite" => {
            RemoteError::UnknownSite(info.to_string())
        }
        "badtoken" | "notloggedin" | "assertuserfailed" | "assertbotfailed" | "permissiondenied"
        | "login-failed" => RemoteError::Authentication(format!("[{code}] {info}")),
        _ => RemoteError::Rejected {
            code: code.to_string(),
            info: info.to_string(),
        },
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn parse_entity_lookup(requested: &str, payload: &Value) -> Result<EntityLookup, RemoteError> {
    let entities = payload
        .get("entities")
        .and_then(Value::as_object)
        .ok_or_else(|| RemoteError::Transport("wbgetentities response without entities".to_string()))?;
    let Some(raw) = entities
        .get(requested)
        .or_else(|| entities.values().next())
    else {
        return Ok(EntityLookup::Missing);
    };
    if raw.get("missing").is_some() {
        return Ok(EntityLookup::Missing);
    }

    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(requested)
        .to_string();
    let redirected_to = raw
        .get("redirects")
        .and_then(|redirects| redirects.get("to"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .or_else(|| (id != requested).then(|| id.clone()));
    if let Some(target) = redirected_to {
        return Ok(EntityLookup::Redirect { target });
    }

    let mut sitelinks = BTreeMap::new();
    if let Some(links) = raw.get("sitelinks").and_then(Value::as_object) {
        for (site, link) in links {
            let title = link
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let badges: BTreeSet<String> = link
                .get("badges")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            sitelinks.insert(
                site.clone(),
                Sitelink {
                    site: site.clone(),
                    title,
                    badges,
                },
            );
        }
    }

    Ok(EntityLookup::Found(Entity {
        id,
        revision: raw.get("lastrevid").and_then(Value::as_u64),
        sitelinks,
    }))
}

fn resolve_redirect_chain(
    site: &str,
    title: &str,
    query: &PageQueryPayload,
) -> Result<RedirectTarget, RemoteError> {
    if query.redirects.is_empty() {
        return Err(RemoteError::NotRedirect {
            site: site.to_string(),
            title: title.to_string(),
        });
    }

    let start = query.resolve_title(title);
    let unresolved = |reason: &str| {
        RemoteError::Transport(format!("unresolved redirect chain for {title} on {site}: {reason}"))
    };
    if !query.redirects.iter().any(|step| step.from == start) {
        return Err(unresolved("no redirect starts at the requested page"));
    }

    let mut visited = BTreeSet::from([start.clone()]);
    let mut current = start;
    while let Some(step) = query.redirects.iter().find(|step| step.from == current) {
        if let Some(interwiki) = &step.tointerwiki {
            return Err(RemoteError::CrossSiteRedirect {
                site: site.to_string(),
                title: title.to_string(),
                interwiki: interwiki.clone(),
            });
        }
        if !visited.insert(step.to.clone()) {
            return Err(RemoteError::CircularRedirect {
                site: site.to_string(),
                title: title.to_string(),
            });
        }
        current = step.to.clone();
    }

    let Some(page) = query.pages.iter().find(|page| page.title == current) else {
        return Err(unresolved("final target missing from the response"));
    };
    // A chain that still ends on a redirect page did not resolve; MediaWiki stops at loops.
    if page.redirect {
        return Err(RemoteError::CircularRedirect {
            site: site.to_string(),
            title: title.to_string(),
        });
    }
    Ok(RedirectTarget {
        exists: !page.missing && !page.invalid,
        title: current,
    })
}

fn parse_namespaces(payload: &Value) -> BTreeMap<i32, NamespaceNames> {
    let mut out = BTreeMap::new();
    let Some(namespaces) = payload
        .get("query")
        .and_then(|query| query.get("namespaces"))
        .and_then(Value::as_object)
    else {
        return out;
    };
    for namespace in namespaces.values() {
        let Some(id) = namespace
            .get("id")
            .and_then(Value::as_i64)
            .and_then(|id| i32::try_from(id).ok())
        else {
            continue;
        };
        let local = namespace
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let canonical = namespace
            .get("canonical")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        out.insert(id, NamespaceNames { local, canonical });
    }
    out
}

/// Database name to family and language, from a `sitematrix` response.
fn parse_site_matrix(payload: &Value) -> BTreeMap<String, SiteIdentity> {
    let mut out = BTreeMap::new();
    let Some(matrix) = payload.get("sitematrix").and_then(Value::as_object) else {
        return out;
    };
    for (key, entry) in matrix {
        if key == "count" {
            continue;
        }
        if key == "specials" {
            for site in entry.as_array().into_iter().flatten() {
                let (Some(db_name), Some(code)) = (
                    site.get("dbname").and_then(Value::as_str),
                    site.get("code").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let language = site
                    .get("lang")
                    .and_then(Value::as_str)
                    .unwrap_or(code)
                    .to_string();
                out.insert(
                    db_name.to_string(),
                    SiteIdentity {
                        family: code.to_string(),
                        language,
                    },
                );
            }
            continue;
        }

        let Some(language) = entry.get("code").and_then(Value::as_str) else {
            continue;
        };
        for site in entry
            .get("site")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(db_name), Some(code)) = (
                site.get("dbname").and_then(Value::as_str),
                site.get("code").and_then(Value::as_str),
            ) else {
                continue;
            };
            let family = if code == "wiki" { "wikipedia" } else { code };
            out.insert(
                db_name.to_string(),
                SiteIdentity {
                    family: family.to_string(),
                    language: language.to_string(),
                },
            );
        }
    }
    out
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryResponse {
    #[serde(default)]
    query: PageQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryPayload {
    #[serde(default)]
    normalized: Vec<TitleMapping>,
    #[serde(default)]
    converted: Vec<TitleMapping>,
    #[serde(default)]
    pages: Vec<PageInfo>,
    #[serde(default)]
    redirects: Vec<RedirectStep>,
}

impl PageQueryPayload {
    /// The requested title as the API spelled it after normalization and variant conversion.
    fn resolve_title(&self, requested: &str) -> String {
        let mut title = requested.to_string();
        for mappings in [&self.normalized, &self.converted] {
            if let Some(mapping) = mappings.iter().find(|mapping| mapping.from == title) {
                title = mapping.to.clone();
            }
        }
        title
    }
}

#[derive(Debug, Deserialize)]
struct TitleMapping {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize, Default)]
struct PageInfo {
    #[serde(default)]
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    redirect: bool,
    length: Option<u64>,
    pageprops: Option<PageProps>,
}

#[derive(Debug, Deserialize, Default)]
struct PageProps {
    wikibase_item: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedirectStep {
    from: String,
    to: String,
    tointerwiki: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    csrftoken: Option<String>,
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        PageQueryResponse, classify_api_error, parse_entity_lookup, parse_namespaces,
        parse_site_matrix, resolve_redirect_chain,
    };
    use crate::remote::{EntityLookup, ErrorClass, RemoteError};

    fn page_query(value: serde_json::Value) -> PageQueryResponse {
        serde_json::from_value(value).expect("page query")
    }

    #[test]
    fn entity_lookup_reads_sitelinks_and_revision() {
        let payload = json!({
            "entities": {
                "Q1": {
                    "type": "item",
                    "id": "Q1",
                    "lastrevid": 4242,
                    "sitelinks": {
                        "enwiki": {"site": "enwiki", "title": "Old name", "badges": ["Q70893996"]},
                        "dewiki": {"site": "dewiki", "title": "Alter Name", "badges": []}
                    }
                }
            },
            "success": 1
        });
        let EntityLookup::Found(entity) = parse_entity_lookup("Q1", &payload).expect("parse") else {
            panic!("expected entity");
        };
        assert_eq!(entity.revision, Some(4242));
        let sitelink = entity.sitelink("enwiki").expect("enwiki sitelink");
        assert_eq!(sitelink.title, "Old name");
        assert!(sitelink.has_badge("Q70893996"));
        assert!(entity.sitelink("dewiki").expect("dewiki").badges.is_empty());
    }

    #[test]
    fn entity_lookup_detects_missing_and_redirected_items() {
        let missing = json!({"entities": {"Q404": {"id": "Q404", "missing": true}}});
        assert_eq!(
            parse_entity_lookup("Q404", &missing).expect("parse"),
            EntityLookup::Missing
        );

        let redirected = json!({
            "entities": {
                "Q5": {"id": "Q6", "type": "item", "redirects": {"from": "Q5", "to": "Q6"}}
            }
        });
        assert_eq!(
            parse_entity_lookup("Q5", &redirected).expect("parse"),
            EntityLookup::Redirect {
                target: "Q6".to_string()
            }
        );
    }

    #[test]
    fn api_errors_map_onto_taxonomy() {
        assert_eq!(
            classify_api_error("editconflict", "conflict").class(),
            ErrorClass::Expected
        );
        assert_eq!(
            classify_api_error("not-badge", "Q1 is not a badge").class(),
            ErrorClass::Contract
        );
        assert_eq!(
            classify_api_error("paramvalidationfailed", "bad").class(),
            ErrorClass::Contract
        );
        assert_eq!(
            classify_api_error("protectedpage", "locked").class(),
            ErrorClass::External
        );
        assert!(matches!(
            classify_api_error("assertbotfailed", "no bot"),
            RemoteError::Authentication(_)
        ));
    }

    #[test]
    fn redirect_chain_resolves_to_final_target() {
        let parsed = page_query(json!({
            "query": {
                "redirects": [{"from": "Old", "to": "Middle"}, {"from": "Middle", "to": "New"}],
                "pages": [{"pageid": 7, "ns": 0, "title": "New", "length": 900}]
            }
        }));
        let target = resolve_redirect_chain("enwiki", "Old", &parsed.query).expect("resolve");
        assert_eq!(target.title, "New");
        assert!(target.exists);
    }

    #[test]
    fn redirect_chain_starts_from_normalized_title() {
        let parsed = page_query(json!({
            "query": {
                "normalized": [{"fromencoded": false, "from": "old_name", "to": "Old name"}],
                "redirects": [{"from": "Old name", "to": "New name"}],
                "pages": [{"pageid": 7, "ns": 0, "title": "New name", "length": 900}]
            }
        }));
        let target = resolve_redirect_chain("enwiki", "old_name", &parsed.query).expect("resolve");
        assert_eq!(target.title, "New name");
        assert!(target.exists);
    }

    #[test]
    fn redirect_chain_that_cannot_be_followed_is_an_error() {
        let detached = page_query(json!({
            "query": {
                "redirects": [{"from": "Somewhere else", "to": "New name"}],
                "pages": [{"pageid": 7, "ns": 0, "title": "New name"}]
            }
        }));
        let error = resolve_redirect_chain("enwiki", "Old name", &detached.query)
            .expect_err("unmatched chain");
        assert!(matches!(error, RemoteError::Transport(_)));

        let no_final_page = page_query(json!({
            "query": {
                "redirects": [{"from": "Old name", "to": "New name"}],
                "pages": []
            }
        }));
        let error = resolve_redirect_chain("enwiki", "Old name", &no_final_page.query)
            .expect_err("final page absent");
        assert!(matches!(error, RemoteError::Transport(_)));
    }

    #[test]
    fn redirect_chain_reports_missing_target() {
        let parsed = page_query(json!({
            "query": {
                "redirects": [{"from": "Old", "to": "Gone"}],
                "pages": [{"ns": 0, "title": "Gone", "missing": true}]
            }
        }));
        let target = resolve_redirect_chain("enwiki", "Old", &parsed.query).expect("resolve");
        assert!(!target.exists);
    }

    #[test]
    fn redirect_chain_detects_loops_and_interwiki() {
        let looped = page_query(json!({
            "query": {
                "redirects": [{"from": "A", "to": "B"}, {"from": "B", "to": "A"}],
                "pages": [{"pageid": 1, "ns": 0, "title": "A", "redirect": true}]
            }
        }));
        assert!(matches!(
            resolve_redirect_chain("enwiki", "A", &looped.query),
            Err(RemoteError::CircularRedirect { .. })
        ));

        let interwiki = page_query(json!({
            "query": {
                "redirects": [{"from": "Word", "to": "Word", "tointerwiki": "wikt"}],
                "pages": []
            }
        }));
        assert!(matches!(
            resolve_redirect_chain("enwiki", "Word", &interwiki.query),
            Err(RemoteError::CrossSiteRedirect { .. })
        ));

        let plain = page_query(json!({"query": {"pages": [{"pageid": 3, "ns": 0, "title": "Article"}]}}));
        assert!(matches!(
            resolve_redirect_chain("enwiki", "Article", &plain.query),
            Err(RemoteError::NotRedirect { .. })
        ));
    }

    #[test]
    fn namespaces_keep_local_and_canonical_names() {
        let payload = json!({
            "query": {
                "namespaces": {
                    "0": {"id": 0, "case": "first-letter", "name": "", "content": true},
                    "10": {"id": 10, "case": "first-letter", "name": "Vorlage", "canonical": "Template"}
                }
            }
        });
        let namespaces = parse_namespaces(&payload);
        assert_eq!(namespaces.len(), 2);
        assert_eq!(namespaces[&10].local, "Vorlage");
        assert_eq!(namespaces[&10].canonical.as_deref(), Some("Template"));
        assert_eq!(namespaces[&0].canonical, None);
    }

    #[test]
    fn site_matrix_maps_language_sites_and_specials() {
        let payload = json!({
            "sitematrix": {
                "count": 3,
                "0": {
                    "code": "de",
                    "name": "Deutsch",
                    "site": [
                        {"url": "https://de.wikipedia.org", "dbname": "dewiki", "code": "wiki", "sitename": "Wikipedia"},
                        {"url": "https://de.wiktionary.org", "dbname": "dewiktionary", "code": "wiktionary", "sitename": "Wiktionary"}
                    ]
                },
                "specials": [
                    {"url": "https://commons.wikimedia.org", "dbname": "commonswiki", "code": "commons", "lang": "commons", "sitename": "Wikimedia Commons"}
                ]
            }
        });
        let matrix = parse_site_matrix(&payload);
        assert_eq!(matrix["dewiki"].family, "wikipedia");
        assert_eq!(matrix["dewiki"].language, "de");
        assert_eq!(matrix["dewiktionary"].family, "wiktionary");
        assert_eq!(matrix["commonswiki"].family, "commons");
        assert!(!matrix.contains_key("count"));
    }
}
