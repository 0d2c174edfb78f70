use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Transaction, params};
use serde::{Deserialize, Serialize};

use crate::http::normalize_url;
use crate::model::{PageStatus, SLUG_CONTENT};
use crate::store::{SqliteStore, format_timestamp};

/// A page tree plus aliases, as written in a JSON or YAML fixture file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    #[serde(default)]
    pub pages: Vec<PageFixture>,
    #[serde(default)]
    pub aliases: Vec<AliasFixture>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageFixture {
    /// Fixture-local reference used by `redirect_to` and aliases.
    pub key: Option<String>,
    #[serde(default)]
    pub status: PageStatus,
    pub template: Option<String>,
    pub delegate_to: Option<String>,
    pub redirect_to_url: Option<String>,
    pub redirect_to: Option<String>,
    pub publication_date: Option<DateTime<Utc>>,
    pub publication_end_date: Option<DateTime<Utc>>,
    /// language -> content type -> body
    #[serde(default)]
    pub contents: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub children: Vec<PageFixture>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasFixture {
    pub url: String,
    pub page: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Delete every existing page and alias first.
    pub replace: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub pages: usize,
    pub contents: usize,
    pub aliases: usize,
    pub redirects: usize,
}

pub fn load_fixture(path: &Path) -> Result<Fixture> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display())),
        Some("yaml" | "yml") => serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display())),
        _ => bail!(
            "unsupported fixture format for {}; expected .json, .yaml or .yml",
            path.display()
        ),
    }
}

pub fn import_fixture_file(
    store: &mut SqliteStore,
    path: &Path,
    options: ImportOptions,
) -> Result<ImportReport> {
    let fixture = load_fixture(path)?;
    import_fixture(store, &fixture, options)
}

/// Write the fixture in one transaction; nothing is kept if any row fails.
pub fn import_fixture(
    store: &mut SqliteStore,
    fixture: &Fixture,
    options: ImportOptions,
) -> Result<ImportReport> {
    let transaction = store
        .connection_mut()
        .transaction()
        .context("failed to start fixture import transaction")?;

    if options.replace {
        transaction
            .execute_batch(
                "DELETE FROM search_documents;
                 DELETE FROM page_aliases;
                 DELETE FROM contents;
                 DELETE FROM pages;",
            )
            .context("failed to clear existing pages")?;
    }

    let next_tree_id: i64 = transaction
        .query_row("SELECT COALESCE(MAX(tree_id), 0) + 1 FROM pages", [], |row| {
            row.get(0)
        })
        .context("failed to read next tree id")?;

    let mut importer = Importer {
        transaction: &transaction,
        created_at: format_timestamp(&Utc::now()),
        keys: HashMap::new(),
        pending_redirects: Vec::new(),
        pending_aliases: Vec::new(),
        report: ImportReport::default(),
    };
    for (offset, page) in fixture.pages.iter().enumerate() {
        let tree_id = next_tree_id + i64::try_from(offset).context("too many root pages")?;
        importer.insert_page(page, None, tree_id, 0)?;
    }
    for alias in &fixture.aliases {
        importer.pending_aliases.push((
            alias.page.clone(),
            alias.url.clone(),
            alias.language.clone(),
        ));
    }
    importer.link()?;
    let report = importer.report;

    transaction
        .commit()
        .context("failed to commit fixture import transaction")?;
    Ok(report)
}

struct Importer<'t> {
    transaction: &'t Transaction<'t>,
    created_at: String,
    keys: HashMap<String, i64>,
    pending_redirects: Vec<(i64, String)>,
    pending_aliases: Vec<(String, String, Option<String>)>,
    report: ImportReport,
}

impl Importer<'_> {
    fn insert_page(
        &mut self,
        page: &PageFixture,
        parent_id: Option<i64>,
        tree_id: i64,
        position: i64,
    ) -> Result<i64> {
        if !page
            .contents
            .values()
            .any(|by_type| by_type.contains_key(SLUG_CONTENT))
        {
            bail!(
                "fixture page {} has no slug content",
                page.key.as_deref().unwrap_or("<unnamed>")
            );
        }

        self.transaction
            .execute(
                "INSERT INTO pages (
                    parent_id,
                    tree_id,
                    position,
                    status,
                    template,
                    delegate_to,
                    redirect_to_url,
                    publication_date,
                    publication_end_date,
                    creation_date
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    parent_id,
                    tree_id,
                    position,
                    page.status.as_str(),
                    page.template,
                    page.delegate_to,
                    page.redirect_to_url,
                    page.publication_date.as_ref().map(format_timestamp),
                    page.publication_end_date.as_ref().map(format_timestamp),
                    self.created_at,
                ],
            )
            .context("failed to insert fixture page")?;
        let page_id = self.transaction.last_insert_rowid();
        self.report.pages += 1;

        if let Some(key) = &page.key
            && self.keys.insert(key.clone(), page_id).is_some()
        {
            bail!("duplicate fixture page key {key:?}");
        }

        for (language, by_type) in &page.contents {
            for (content_type, body) in by_type {
                self.transaction
                    .execute(
                        "INSERT INTO contents (page_id, language, content_type, body, creation_date)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![page_id, language, content_type, body, self.created_at],
                    )
                    .with_context(|| {
                        format!("failed to insert {language}/{content_type} content")
                    })?;
                self.report.contents += 1;
            }
        }

        if let Some(target) = &page.redirect_to {
            self.pending_redirects.push((page_id, target.clone()));
        }
        for url in &page.aliases {
            self.pending_aliases
                .push((format!("#{page_id}"), url.clone(), None));
        }

        for (index, child) in page.children.iter().enumerate() {
            let position = i64::try_from(index).context("too many child pages")?;
            self.insert_page(child, Some(page_id), tree_id, position)?;
        }
        Ok(page_id)
    }

    /// Resolve key references once every page has an id.
    fn link(&mut self) -> Result<()> {
        for (page_id, target) in std::mem::take(&mut self.pending_redirects) {
            let target_id = self.lookup(&target)?;
            self.transaction
                .execute(
                    "UPDATE pages SET redirect_to_id = ?1 WHERE id = ?2",
                    params![target_id, page_id],
                )
                .with_context(|| format!("failed to link redirect to {target:?}"))?;
            self.report.redirects += 1;
        }

        for (page, url, language) in std::mem::take(&mut self.pending_aliases) {
            let page_id = match page.strip_prefix('#') {
                Some(id) => id.parse::<i64>().context("invalid internal page reference")?,
                None => self.lookup(&page)?,
            };
            let url = normalize_url(&url);
            self.transaction
                .execute(
                    "INSERT INTO page_aliases (page_id, url, language) VALUES (?1, ?2, ?3)",
                    params![page_id, url, language],
                )
                .with_context(|| format!("failed to insert alias {url}"))?;
            self.report.aliases += 1;
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<i64> {
        self.keys
            .get(key)
            .copied()
            .with_context(|| format!("unknown fixture page key {key:?}"))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::http::PageRequest;
    use crate::store::tests::memory_store;
    use crate::store::{AliasStore, PageStore};

    const SITE_YAML: &str = r#"
pages:
  - key: home
    contents:
      en: { slug: home, title: Home, body: "<p>hello</p>" }
      fr: { slug: accueil, title: Accueil }
    aliases: ["/index.html/"]
    children:
      - key: about
        template: pages/about.html
        contents:
          en: { slug: about, title: About }
      - status: draft
        contents:
          en: { slug: soon }
  - key: legacy
    redirect_to: about
    publication_date: "2020-03-01T00:00:00Z"
    contents:
      en: { slug: legacy }
aliases:
  - url: /a-propos
    page: about
    language: fr
"#;

    #[test]
    fn imports_nested_yaml_fixture() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("site.yaml");
        fs::write(&path, SITE_YAML).expect("write fixture");
        let mut store = memory_store();

        let report = import_fixture_file(&mut store, &path, ImportOptions::default())
            .expect("import");
        assert_eq!(
            report,
            ImportReport {
                pages: 4,
                contents: 9,
                aliases: 2,
                redirects: 1,
            }
        );

        let about = PageStore::from_path(&store, "home/about", "en", true)
            .expect("lookup")
            .expect("about");
        assert_eq!(about.template.as_deref(), Some("pages/about.html"));
        assert!(PageStore::from_path(&store, "home/soon", "en", true)
            .expect("lookup")
            .is_none());

        let legacy = PageStore::from_path(&store, "legacy", "en", true)
            .expect("lookup")
            .expect("legacy");
        assert_eq!(legacy.redirect_to_id, Some(about.id));
        assert!(legacy.publication_date.is_some());
        assert_ne!(legacy.tree_id, about.tree_id);

        let request = PageRequest::new("/index.html");
        let alias = AliasStore::from_path(&store, &request, "index.html", "en")
            .expect("alias")
            .expect("home alias");
        assert_eq!(alias.url, "/index.html");
        assert!(AliasStore::from_path(&store, &request, "a-propos", "en")
            .expect("alias")
            .is_none());
    }

    #[test]
    fn json_fixtures_and_replace_mode() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("site.json");
        fs::write(
            &path,
            r#"{"pages": [{"contents": {"en": {"slug": "only"}}}]}"#,
        )
        .expect("write fixture");
        let mut store = memory_store();

        import_fixture_file(&mut store, &path, ImportOptions::default()).expect("first");
        import_fixture_file(&mut store, &path, ImportOptions::default()).expect("second");
        assert_eq!(store.stats().expect("stats").pages, 2);

        import_fixture_file(&mut store, &path, ImportOptions { replace: true }).expect("replace");
        assert_eq!(store.stats().expect("stats").pages, 1);
    }

    #[test]
    fn broken_fixture_leaves_database_untouched() {
        let fixture: Fixture = serde_yaml::from_str(
            r#"
pages:
  - key: a
    contents:
      en: { slug: a }
  - redirect_to: missing
    contents:
      en: { slug: b }
"#,
        )
        .expect("parse");
        let mut store = memory_store();
        let error = import_fixture(&mut store, &fixture, ImportOptions::default())
            .expect_err("must fail");
        assert!(error.to_string().contains("unknown fixture page key"));
        assert_eq!(store.stats().expect("stats").pages, 0);
    }

    #[test]
    fn rejects_pages_without_slug_and_unknown_formats() {
        let fixture: Fixture =
            serde_yaml::from_str("pages:\n  - contents:\n      en: { title: Nameless }\n")
                .expect("parse");
        let mut store = memory_store();
        let error = import_fixture(&mut store, &fixture, ImportOptions::default())
            .expect_err("must fail");
        assert!(error.to_string().contains("no slug"));

        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("site.toml");
        fs::write(&path, "").expect("write");
        assert!(load_fixture(&path).is_err());
    }
}
