use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags};

use crate::model::{ProjectDescriptor, RedirectFact};

pub const META_DB_FILENAME: &str = "meta.db";

const PROJECTS_SQL: &str = "SELECT dbname, url, family, lang
FROM wiki
WHERE is_closed = 0 AND has_wikidata = 1
ORDER BY dbname ASC";

/// Every connected redirect page with its target and the target's item, if any.
const REDIRECT_FACTS_SQL: &str = "SELECT
  redirect_page.page_id AS redirect_id,
  redirect_page.page_namespace AS redirect_namespace,
  redirect_page.page_title AS redirect_title,
  redirect_pp.pp_value AS redirect_qid,
  rd_namespace AS target_namespace,
  rd_title AS target_title,
  rd_fragment AS target_fragment,
  rd_interwiki AS target_interwiki,
  target_page.page_id AS target_id,
  target_pp.pp_value AS target_qid
FROM
  page AS redirect_page
    JOIN page_props AS redirect_pp
      ON (redirect_page.page_id = redirect_pp.pp_page AND redirect_pp.pp_propname = 'wikibase_item')
    LEFT JOIN redirect ON redirect_page.page_id = rd_from
      LEFT JOIN page AS target_page
        ON (redirect.rd_namespace = target_page.page_namespace AND redirect.rd_title = target_page.page_title)
        LEFT JOIN page_props AS target_pp
          ON (target_page.page_id = target_pp.pp_page AND target_pp.pp_propname = 'wikibase_item')
WHERE
  redirect_page.page_is_redirect = 1
ORDER BY redirect_page.page_id ASC";

/// Directory of per-wiki SQLite snapshots plus the `meta.db` project list.
#[derive(Debug, Clone)]
pub struct Replica {
    dir: PathBuf,
}

impl Replica {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, db_name: &str) -> Result<PathBuf> {
        if db_name.is_empty()
            || !db_name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            bail!("invalid database name `{db_name}`");
        }
        Ok(self.dir.join(format!("{db_name}.db")))
    }

    /// Open wikis with item support, in database-name order.
    pub fn list_projects(&self) -> Result<Vec<ProjectDescriptor>> {
        let connection = open_read_only(&self.dir.join(META_DB_FILENAME))?;
        let mut statement = connection
            .prepare(PROJECTS_SQL)
            .context("failed to prepare project list query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(ProjectDescriptor {
                    db_name: row.get(0)?,
                    base_url: row.get(1)?,
                    family: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    language: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })
            .context("failed to run project list query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode project row")?);
        }
        Ok(out)
    }

    pub fn redirect_facts(&self, db_name: &str) -> Result<Vec<RedirectFact>> {
        let connection = open_read_only(&self.snapshot_path(db_name)?)?;
        let mut statement = connection
            .prepare(REDIRECT_FACTS_SQL)
            .with_context(|| format!("failed to prepare redirect query for {db_name}"))?;
        let rows = statement
            .query_map([], |row| {
                Ok(RedirectFact {
                    redirect_id: row.get(0)?,
                    redirect_namespace: row.get(1)?,
                    redirect_title: row.get(2)?,
                    redirect_qid: row.get(3)?,
                    target_namespace: row.get(4)?,
                    target_title: non_empty(row.get(5)?),
                    target_fragment: non_empty(row.get(6)?),
                    target_interwiki: non_empty(row.get(7)?),
                    target_id: row.get(8)?,
                    target_qid: non_empty(row.get(9)?),
                })
            })
            .with_context(|| format!("failed to run redirect query for {db_name}"))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.with_context(|| format!("failed to decode redirect row for {db_name}"))?);
        }
        Ok(out)
    }
}

fn open_read_only(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        bail!("replica snapshot {} does not exist", db_path.display());
    }
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    Ok(connection)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use tempfile::tempdir;

    use super::{META_DB_FILENAME, Replica};

    const SCHEMA: &str = "
CREATE TABLE page (
    page_id INTEGER PRIMARY KEY,
    page_namespace INTEGER NOT NULL,
    page_title TEXT NOT NULL,
    page_is_redirect INTEGER NOT NULL
);
CREATE TABLE page_props (
    pp_page INTEGER NOT NULL,
    pp_propname TEXT NOT NULL,
    pp_value TEXT NOT NULL
);
CREATE TABLE redirect (
    rd_from INTEGER PRIMARY KEY,
    rd_namespace INTEGER NOT NULL,
    rd_title TEXT NOT NULL,
    rd_interwiki TEXT,
    rd_fragment TEXT
);
";

    fn write_snapshot(dir: &std::path::Path) {
        let connection = Connection::open(dir.join("enwiki.db")).expect("open snapshot");
        connection.execute_batch(SCHEMA).expect("schema");
        connection
            .execute_batch(
                "
INSERT INTO page VALUES (1, 0, 'Old_name', 1);
INSERT INTO page VALUES (2, 0, 'New_name', 0);
INSERT INTO page VALUES (3, 0, 'Dangling', 1);
INSERT INTO page VALUES (4, 10, 'Old_template', 1);
INSERT INTO page VALUES (5, 10, 'New_template', 0);
INSERT INTO page VALUES (6, 0, 'Elsewhere', 1);
INSERT INTO page VALUES (7, 0, 'Article', 0);
INSERT INTO page VALUES (8, 0, 'Unconnected_redirect', 1);
INSERT INTO page_props VALUES (1, 'wikibase_item', 'Q1');
INSERT INTO page_props VALUES (2, 'wikibase_item', 'Q2');
INSERT INTO page_props VALUES (3, 'wikibase_item', 'Q3');
INSERT INTO page_props VALUES (4, 'wikibase_item', 'Q4');
INSERT INTO page_props VALUES (6, 'wikibase_item', 'Q6');
INSERT INTO page_props VALUES (7, 'wikibase_item', 'Q7');
INSERT INTO page_props VALUES (1, 'defaultsort', 'Name, Old');
INSERT INTO redirect VALUES (1, 0, 'New_name', '', 'History');
INSERT INTO redirect VALUES (3, 0, 'Nowhere', '', '');
INSERT INTO redirect VALUES (4, 10, 'New_template', '', NULL);
INSERT INTO redirect VALUES (6, 0, 'Somewhere', 'wikt', '');
INSERT INTO redirect VALUES (8, 0, 'New_name', '', '');
",
            )
            .expect("rows");
    }

    #[test]
    fn redirect_facts_follow_join_semantics() {
        let temp = tempdir().expect("tempdir");
        write_snapshot(temp.path());
        let replica = Replica::new(temp.path());

        let facts = replica.redirect_facts("enwiki").expect("facts");
        assert_eq!(
            facts.iter().map(|fact| fact.redirect_id).collect::<Vec<_>>(),
            vec![1, 3, 4, 6]
        );

        let connected = &facts[0];
        assert_eq!(connected.redirect_qid, "Q1");
        assert_eq!(connected.target_id, Some(2));
        assert_eq!(connected.target_qid.as_deref(), Some("Q2"));
        assert_eq!(connected.target_fragment.as_deref(), Some("History"));
        assert_eq!(connected.target_interwiki, None);

        let dangling = &facts[1];
        assert_eq!(dangling.target_title.as_deref(), Some("Nowhere"));
        assert_eq!(dangling.target_id, None);
        assert_eq!(dangling.target_fragment, None);

        let template = &facts[2];
        assert_eq!(template.redirect_namespace, 10);
        assert_eq!(template.target_id, Some(5));
        assert_eq!(template.target_qid, None);

        assert_eq!(facts[3].target_interwiki.as_deref(), Some("wikt"));
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let replica = Replica::new(temp.path());
        let error = replica.redirect_facts("dewiki").expect_err("must fail");
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn database_names_cannot_escape_replica_dir() {
        let replica = Replica::new("/tmp/replica");
        assert!(replica.snapshot_path("../etc/passwd").is_err());
        assert!(replica.snapshot_path("").is_err());
        assert!(replica.snapshot_path("be_x_oldwiki").is_ok());
    }

    #[test]
    fn list_projects_skips_closed_and_unconnected_wikis() {
        let temp = tempdir().expect("tempdir");
        let connection =
            Connection::open(temp.path().join(META_DB_FILENAME)).expect("open meta");
        connection
            .execute_batch(
                "
CREATE TABLE wiki (
    dbname TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    family TEXT,
    lang TEXT,
    is_closed INTEGER NOT NULL,
    has_wikidata INTEGER NOT NULL
);
INSERT INTO wiki VALUES ('enwiki', 'https://en.wikipedia.org', 'wikipedia', 'en', 0, 1);
INSERT INTO wiki VALUES ('aawiki', 'https://aa.wikipedia.org', 'wikipedia', 'aa', 1, 1);
INSERT INTO wiki VALUES ('testwiki', 'https://test.wikipedia.org', 'wikipedia', 'en', 0, 0);
INSERT INTO wiki VALUES ('commonswiki', 'https://commons.wikimedia.org', 'commons', NULL, 0, 1);
",
            )
            .expect("meta rows");
        drop(connection);

        let projects = Replica::new(temp.path()).list_projects().expect("projects");
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].db_name, "commonswiki");
        assert_eq!(projects[0].language, "");
        assert_eq!(projects[1].db_name, "enwiki");
        assert_eq!(projects[1].base_url, "https://en.wikipedia.org");
    }
}
