use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::{ActionBucket, Bucket, BucketSet, ProjectStats};
use crate::config::BotConfig;
use crate::join::join_master_records;
use crate::model::{BadgeIds, ProjectDescriptor, RedirectFact, TagAssignment};
use crate::output::OutputFiles;
use crate::query_service::QueryServiceClient;
use crate::reconcile::{BucketReport, Reconciler};
use crate::remote::{FactSource, RemoteApi, ReportPublisher, SiteMetadata};
use crate::replica::Replica;
use crate::report::{PrefixTable, ReportBuilder};

/// Replica snapshots for redirects, the query service for badge assignments.
pub struct LiveFactSource {
    replica: Replica,
    query_service: QueryServiceClient,
    badges: BadgeIds,
}

impl LiveFactSource {
    pub fn new(replica: Replica, query_service: QueryServiceClient, badges: BadgeIds) -> Self {
        Self {
            replica,
            query_service,
            badges,
        }
    }
}

impl FactSource for LiveFactSource {
    fn list_projects(&mut self) -> Result<Vec<ProjectDescriptor>> {
        self.replica.list_projects()
    }

    fn fetch_redirect_facts(&mut self, project: &ProjectDescriptor) -> Result<Vec<RedirectFact>> {
        self.replica.redirect_facts(&project.db_name)
    }

    fn fetch_tag_assignments(
        &mut self,
        project: &ProjectDescriptor,
    ) -> Result<Vec<TagAssignment>> {
        self.query_service
            .tag_assignments(&project.base_url, &self.badges)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub simulate: bool,
    pub projects_seen: usize,
    pub projects_processed: usize,
    pub projects_failed: usize,
    pub applied: usize,
    pub simulated: usize,
    pub skipped: usize,
    pub aborted_buckets: Vec<String>,
    pub report_rows: usize,
    pub report_published: bool,
}

impl RunSummary {
    fn absorb(&mut self, report: &BucketReport) {
        self.applied += report.applied;
        self.simulated += report.simulated;
        self.skipped += report.skipped;
        if report.aborted.is_some() {
            self.aborted_buckets
                .push(format!("{}:{}", report.site, report.bucket.as_str()));
        }
    }
}

/// Projects selected by `[run].only_projects`; an empty filter keeps all of them.
pub fn select_projects(projects: Vec<ProjectDescriptor>, only: &[String]) -> Vec<ProjectDescriptor> {
    if only.is_empty() {
        return projects;
    }
    projects
        .into_iter()
        .filter(|project| only.iter().any(|name| name == &project.db_name))
        .collect()
}

/// One full pass over every selected project.
pub fn run_all<F, A>(
    config: &BotConfig,
    facts: &mut F,
    api: &mut A,
    output: &OutputFiles,
) -> Result<RunSummary>
where
    F: FactSource,
    A: RemoteApi + SiteMetadata + ReportPublisher,
{
    output.clear()?;
    let policy = config.reconcile_policy();
    let mut report = ReportBuilder::new(PrefixTable::from_config(&config.report));
    let mut summary = RunSummary {
        simulate: policy.simulate,
        ..RunSummary::default()
    };

    let projects = select_projects(
        facts.list_projects().context("failed to list projects")?,
        &config.run.only_projects,
    );
    summary.projects_seen = projects.len();
    info!(
        projects = projects.len(),
        simulate = policy.simulate,
        "starting reconciliation run"
    );

    for (index, project) in projects.iter().enumerate() {
        if index > 0 && config.run.project_delay_ms > 0 {
            sleep(Duration::from_millis(config.run.project_delay_ms));
        }
        let site = project.db_name.as_str();

        let (redirects, assignments) = match fetch_project(facts, project) {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(site, reason = %format!("{error:#}"), "skipping project");
                summary.projects_failed += 1;
                continue;
            }
        };

        let records = join_master_records(&redirects, &assignments, &config.badges);
        let buckets = BucketSet::classify(&records);
        let stats = buckets.stats();
        output.append_cases(site, buckets.members(Bucket::AllRedirects))?;
        output.append_stats(site, &stats)?;
        info!(site, "{}", stats.summary_line(site));

        let mut reconciler = Reconciler::new(api, &policy);
        for bucket in ActionBucket::ALL {
            if bucket == ActionBucket::UnconnectedTarget || !config.buckets.enabled(bucket) {
                continue;
            }
            let members = buckets.actionable(bucket);
            if members.is_empty() {
                continue;
            }
            let bucket_report = reconciler.run_bucket(site, bucket, &members);
            summary.absorb(&bucket_report);
        }

        if config.buckets.enabled(ActionBucket::UnconnectedTarget) {
            let members = buckets.actionable(ActionBucket::UnconnectedTarget);
            if !members.is_empty() {
                let context = report.project_context(project, api);
                let fragment = report.append(&context, &members);
                output.append_report_fragment(&fragment)?;
            }
        }
        summary.projects_processed += 1;
    }

    summary.report_rows = report.rows();
    let table = report.finish();
    output.write_report(&table)?;
    summary.report_published = publish_report(config, api, &table, report.rows());

    info!(
        processed = summary.projects_processed,
        failed = summary.projects_failed,
        applied = summary.applied,
        simulated = summary.simulated,
        skipped = summary.skipped,
        "reconciliation run finished"
    );
    Ok(summary)
}

fn fetch_project<F: FactSource>(
    facts: &mut F,
    project: &ProjectDescriptor,
) -> Result<(Vec<RedirectFact>, Vec<TagAssignment>)> {
    let redirects = facts
        .fetch_redirect_facts(project)
        .with_context(|| format!("failed to read redirects of {}", project.db_name))?;
    let assignments = facts
        .fetch_tag_assignments(project)
        .with_context(|| format!("failed to query badges of {}", project.db_name))?;
    Ok((redirects, assignments))
}

fn publish_report<P: ReportPublisher>(
    config: &BotConfig,
    publisher: &mut P,
    table: &str,
    rows: usize,
) -> bool {
    let Some(page) = config.report.page.as_deref() else {
        return false;
    };
    if !config.buckets.enabled(ActionBucket::UnconnectedTarget) {
        return false;
    }
    if config.run.simulate {
        info!(page, rows, simulated = true, "publish report");
        return false;
    }
    match publisher.publish(page, table, &config.report.summary) {
        Ok(()) => {
            info!(page, rows, simulated = false, "publish report");
            true
        }
        Err(error) => {
            warn!(page, reason = %error, "failed to publish report");
            false
        }
    }
}

/// Fetch, join and classify a single project without touching the remote side.
pub fn classify_project<F: FactSource>(
    config: &BotConfig,
    facts: &mut F,
    db_name: &str,
) -> Result<ProjectStats> {
    let projects = facts.list_projects().context("failed to list projects")?;
    let Some(project) = projects.iter().find(|project| project.db_name == db_name) else {
        bail!("project `{db_name}` is not in the project list");
    };
    let (redirects, assignments) = fetch_project(facts, project)?;
    let records = join_master_records(&redirects, &assignments, &config.badges);
    Ok(BucketSet::classify(&records).stats())
}
