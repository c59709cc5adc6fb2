use std::collections::BTreeMap;

use tracing::warn;

use crate::config::ReportSection;
use crate::model::{MasterRecord, NamespaceNames, ProjectDescriptor, SiteIdentity};
use crate::remote::SiteMetadata;

pub const REPORT_HEADER: &str =
    "{| class=\"wikitable\"\n|-\n! item !! project !! redirect !! unconnected target\n";
pub const REPORT_FOOTER: &str = "|}";

const FAMILY_PREFIXES: [(&str, &str); 8] = [
    ("wikipedia", "w"),
    ("wiktionary", "wikt"),
    ("wikibooks", "b"),
    ("wikinews", "n"),
    ("wikiquote", "q"),
    ("wikisource", "s"),
    ("wikiversity", "v"),
    ("wikivoyage", "voy"),
];

const SITE_PREFIXES: [(&str, &str); 5] = [
    ("commonswiki", "c"),
    ("specieswiki", "species"),
    ("metawiki", "m"),
    ("mediawikiwiki", "mw"),
    ("wikidatawiki", "d"),
];

/// Interwiki prefixes used to link from the report page to client wiki pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixTable {
    families: BTreeMap<String, String>,
    sites: BTreeMap<String, String>,
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self {
            families: to_map(&FAMILY_PREFIXES),
            sites: to_map(&SITE_PREFIXES),
        }
    }
}

impl PrefixTable {
    /// Built-in table with the configured entries layered on top.
    pub fn from_config(report: &ReportSection) -> Self {
        let mut table = Self::default();
        table.families.extend(report.prefixes.clone());
        table.sites.extend(report.site_prefixes.clone());
        table
    }

    pub fn link_prefix(&self, db_name: &str, identity: &SiteIdentity) -> String {
        if let Some(prefix) = self.sites.get(db_name) {
            return format!(":{prefix}:");
        }
        let family = self
            .families
            .get(&identity.family)
            .map(String::as_str)
            .unwrap_or(identity.family.as_str());
        format!(":{family}:{}:", identity.language)
    }
}

fn to_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

/// Per-project link data, resolved once before any row of the project is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectReportContext {
    pub db_name: String,
    pub prefix: String,
    pub namespaces: BTreeMap<i32, NamespaceNames>,
}

impl ProjectReportContext {
    /// Namespace prefix and the parenthesised canonical name, both empty for the main namespace.
    ///
    /// Namespaces the site did not report fall back to their built-in canonical name;
    /// `None` when neither is known.
    fn namespace_parts(&self, namespace: i32) -> Option<(String, String)> {
        if namespace == 0 {
            return Some((String::new(), String::new()));
        }
        let Some(names) = self.namespaces.get(&namespace) else {
            let canonical = canonical_namespace(namespace);
            warn!(
                site = self.db_name.as_str(),
                namespace,
                fallback = canonical.unwrap_or("-"),
                "namespace name unknown"
            );
            return canonical.map(|name| (format!("{name}:"), String::new()));
        };
        let note = match &names.canonical {
            Some(canonical) if canonical != &names.local => format!(" ({canonical})"),
            _ => String::new(),
        };
        Some((format!("{}:", names.local), note))
    }
}

/// Canonical names MediaWiki accepts on every site.
fn canonical_namespace(namespace: i32) -> Option<&'static str> {
    let name = match namespace {
        -2 => "Media",
        -1 => "Special",
        1 => "Talk",
        2 => "User",
        3 => "User talk",
        4 => "Project",
        5 => "Project talk",
        6 => "File",
        7 => "File talk",
        8 => "MediaWiki",
        9 => "MediaWiki talk",
        10 => "Template",
        11 => "Template talk",
        12 => "Help",
        13 => "Help talk",
        14 => "Category",
        15 => "Category talk",
        828 => "Module",
        829 => "Module talk",
        _ => return None,
    };
    Some(name)
}

/// Append-only report table covering a whole run.
#[derive(Debug, Clone, Default)]
pub struct ReportBuilder {
    prefixes: PrefixTable,
    body: String,
    rows: usize,
}

impl ReportBuilder {
    pub fn new(prefixes: PrefixTable) -> Self {
        Self {
            prefixes,
            body: String::new(),
            rows: 0,
        }
    }

    pub fn project_context<M: SiteMetadata>(
        &self,
        project: &ProjectDescriptor,
        metadata: &mut M,
    ) -> ProjectReportContext {
        let identity = match metadata.site_identity(&project.db_name) {
            Ok(identity) => identity,
            Err(error) => {
                warn!(
                    site = project.db_name.as_str(),
                    reason = %error,
                    "site identity unavailable, using project list values"
                );
                SiteIdentity {
                    family: project.family.clone(),
                    language: project.language.clone(),
                }
            }
        };
        let namespaces = metadata.namespace_names(project).unwrap_or_else(|error| {
            warn!(
                site = project.db_name.as_str(),
                reason = %error,
                "namespace names unavailable"
            );
            BTreeMap::new()
        });

        ProjectReportContext {
            db_name: project.db_name.clone(),
            prefix: self.prefixes.link_prefix(&project.db_name, &identity),
            namespaces,
        }
    }

    /// Renders the rows of one project, appends them to the body and returns the fragment.
    pub fn append(&mut self, context: &ProjectReportContext, records: &[&MasterRecord]) -> String {
        let mut fragment = String::new();
        for record in records {
            if let Some(row) = render_row(context, record) {
                fragment.push_str(&row);
                self.rows += 1;
            }
        }
        self.body.push_str(&fragment);
        fragment
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn finish(&self) -> String {
        format!("{REPORT_HEADER}{}{REPORT_FOOTER}", self.body)
    }
}

fn render_row(context: &ProjectReportContext, record: &MasterRecord) -> Option<String> {
    let fact = record.redirect.as_ref()?;
    let prefix = &context.prefix;

    let (redirect_ns, redirect_note) = context.namespace_parts(fact.redirect_namespace)?;
    let redirect_title = display_title(&fact.redirect_title);

    let (target_ns, target_note) = context.namespace_parts(fact.target_namespace.unwrap_or(0))?;
    let interwiki = fact
        .target_interwiki
        .as_deref()
        .filter(|value| !value.is_empty())
        .map(|value| format!("{value}:"))
        .unwrap_or_default();
    let target_title = display_title(fact.target_title.as_deref().unwrap_or_default());

    Some(format!(
        "|-\n| {{{{Q|{qid}}}}} || {db} || [[{prefix}{redirect_ns}{redirect_title}]]{redirect_note} || [[{prefix}{target_ns}{interwiki}{target_title}]]{target_note}\n",
        qid = fact.redirect_qid,
        db = context.db_name,
    ))
}

fn display_title(title: &str) -> String {
    title.replace('_', " ")
}
