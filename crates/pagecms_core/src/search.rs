use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::config::PageSettings;
use crate::db::{table_exists, unix_timestamp};
use crate::model::{Page, PageStatus};
use crate::render::TemplateRenderer;
use crate::store::{PageStore, SqliteStore, format_timestamp};

/// Content template rendered into each document's `text` field.
pub const TEXT_TEMPLATE: &str = "search/indexes/pages/page_text.txt";

const FTS_TABLE: &str = "search_documents_fts";

/// One indexed page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub page_id: i64,
    pub title: String,
    pub url: String,
    pub publication_date: Option<String>,
    pub text: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub documents: usize,
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub page_id: i64,
    pub title: String,
    pub url: String,
    pub publication_date: Option<String>,
}

/// Search index adapter for pages.
pub struct PageIndex<'a> {
    settings: &'a PageSettings,
    renderer: Option<&'a dyn TemplateRenderer>,
}

impl<'a> PageIndex<'a> {
    pub fn new(settings: &'a PageSettings) -> Self {
        Self {
            settings,
            renderer: None,
        }
    }

    pub fn with_renderer(mut self, renderer: &'a dyn TemplateRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Pages the index covers: everything except drafts and expired pages.
    pub fn index_queryset(&self, store: &dyn PageStore) -> Result<Vec<Page>> {
        store.pages_excluding(&[PageStatus::Draft, PageStatus::Expired])
    }

    pub fn prepare(&self, store: &dyn PageStore, page: &Page) -> Result<SearchDocument> {
        let lang = self.settings.default_language.as_str();
        let title = store.title(page, lang)?;
        let url = store.url_path(page, lang, self.settings.use_language_prefix)?;
        let publication_date = page.publication_date.as_ref().map(format_timestamp);

        let mut contents = Map::new();
        for content in store.contents(page, lang)? {
            contents.insert(content.content_type, Value::from(content.body));
        }

        let text = match self.renderer.filter(|renderer| renderer.exists(TEXT_TEMPLATE)) {
            Some(renderer) => {
                let mut context = Map::new();
                context.insert(
                    "object".to_string(),
                    json!({
                        "id": page.id,
                        "title": title,
                        "url": url,
                        "publication_date": publication_date,
                        "contents": contents,
                    }),
                );
                renderer
                    .render(TEXT_TEMPLATE, &context, lang)
                    .with_context(|| format!("failed to render search text for page {}", page.id))?
            }
            None => {
                let body = contents
                    .get(crate::model::BODY_CONTENT)
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                format!("{title}\n{body}")
            }
        };
        let text = text.trim().to_string();

        let content_hash = compute_hash(&format!(
            "{title}\u{0}{url}\u{0}{}\u{0}{text}",
            publication_date.as_deref().unwrap_or_default()
        ));
        Ok(SearchDocument {
            page_id: page.id,
            title,
            url,
            publication_date,
            text,
            content_hash,
        })
    }

    /// Write changed documents and drop those whose page left the queryset.
    pub fn update_index(&self, store: &mut SqliteStore) -> Result<IndexReport> {
        let mut documents = Vec::new();
        for page in self.index_queryset(&*store)? {
            documents.push(self.prepare(&*store, &page)?);
        }
        let existing = stored_hashes(store.connection())?;
        let indexed_at_unix =
            i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;

        let connection = store.connection_mut();
        let transaction = connection
            .transaction()
            .context("failed to start search index transaction")?;

        let mut report = IndexReport {
            documents: documents.len(),
            ..IndexReport::default()
        };
        {
            let mut upsert = transaction
                .prepare(
                    "INSERT OR REPLACE INTO search_documents (
                        page_id,
                        title,
                        url,
                        publication_date,
                        text,
                        content_hash,
                        indexed_at_unix
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("failed to prepare search_documents upsert")?;
            for document in &documents {
                if existing.get(&document.page_id) == Some(&document.content_hash) {
                    report.unchanged += 1;
                    continue;
                }
                upsert
                    .execute(params![
                        document.page_id,
                        document.title,
                        document.url,
                        document.publication_date,
                        document.text,
                        document.content_hash,
                        indexed_at_unix,
                    ])
                    .with_context(|| format!("failed to index page {}", document.page_id))?;
                report.written += 1;
            }

            let keep: BTreeSet<i64> = documents.iter().map(|document| document.page_id).collect();
            let mut delete = transaction
                .prepare("DELETE FROM search_documents WHERE page_id = ?1")
                .context("failed to prepare search_documents delete")?;
            for page_id in existing.keys().filter(|page_id| !keep.contains(*page_id)) {
                delete
                    .execute(params![page_id])
                    .with_context(|| format!("failed to drop page {page_id} from the index"))?;
                report.removed += 1;
            }
        }

        transaction
            .commit()
            .context("failed to commit search index transaction")?;

        if report.written > 0 || report.removed > 0 {
            rebuild_fts_index(store.connection())?;
        }
        Ok(report)
    }

    /// Drop every document and index the queryset from scratch.
    pub fn rebuild_index(&self, store: &mut SqliteStore) -> Result<IndexReport> {
        store
            .connection()
            .execute("DELETE FROM search_documents", [])
            .context("failed to clear search_documents table")?;
        let report = self.update_index(store)?;
        rebuild_fts_index(store.connection())?;
        Ok(report)
    }
}

/// Full-text query over indexed documents, with a `LIKE` fallback when FTS5 is unavailable.
pub fn search(connection: &Connection, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Ok(Vec::new());
    }
    if table_exists(connection, FTS_TABLE).unwrap_or(false)
        && let Ok(hits) = search_fts(connection, &normalized, limit)
    {
        return Ok(hits);
    }
    search_like(connection, &normalized, limit)
}

fn search_fts(connection: &Connection, normalized: &str, limit: usize) -> Result<Vec<SearchHit>> {
    let limit_i64 = i64::try_from(limit).context("search limit does not fit into i64")?;
    let fts_query = format!("\"{}\" *", normalized.replace('"', "\"\""));
    let mut statement = connection
        .prepare(
            "SELECT sd.page_id, sd.title, sd.url, sd.publication_date
             FROM search_documents_fts fts
             JOIN search_documents sd ON sd.page_id = fts.rowid
             WHERE search_documents_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )
        .context("failed to prepare FTS search query")?;
    let rows = statement
        .query_map(params![fts_query, limit_i64], decode_hit)
        .context("failed to run FTS search query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode FTS search row")?);
    }
    Ok(out)
}

fn search_like(connection: &Connection, normalized: &str, limit: usize) -> Result<Vec<SearchHit>> {
    let wildcard = format!("%{normalized}%");
    let limit_i64 = i64::try_from(limit).context("search limit does not fit into i64")?;
    let mut statement = connection
        .prepare(
            "SELECT page_id, title, url, publication_date
             FROM search_documents
             WHERE lower(title) LIKE lower(?1) OR lower(text) LIKE lower(?1)
             ORDER BY
               CASE WHEN lower(title) LIKE lower(?1) THEN 0 ELSE 1 END,
               title ASC
             LIMIT ?2",
        )
        .context("failed to prepare search query")?;
    let rows = statement
        .query_map(params![wildcard, limit_i64], decode_hit)
        .context("failed to run search query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode search row")?);
    }
    Ok(out)
}

fn decode_hit(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchHit> {
    Ok(SearchHit {
        page_id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        publication_date: row.get(3)?,
    })
}

fn stored_hashes(connection: &Connection) -> Result<BTreeMap<i64, String>> {
    let mut statement = connection
        .prepare("SELECT page_id, content_hash FROM search_documents")
        .context("failed to prepare stored hash query")?;
    let rows = statement
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .context("failed to run stored hash query")?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (page_id, hash) = row.context("failed to decode stored hash row")?;
        out.insert(page_id, hash);
    }
    Ok(out)
}

fn rebuild_fts_index(connection: &Connection) -> Result<()> {
    if table_exists(connection, FTS_TABLE)? {
        connection
            .execute_batch("INSERT INTO search_documents_fts(search_documents_fts) VALUES('rebuild')")
            .context("failed to rebuild search_documents_fts")?;
    }
    Ok(())
}

fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::render::FileTemplateRenderer;
    use crate::store::tests::{Seed, memory_store};

    fn seeded() -> (SqliteStore, i64, i64) {
        let store = memory_store();
        let seed = Seed {
            connection: store.connection(),
        };
        let guide = seed.page(
            None,
            1,
            PageStatus::Published,
            &[
                ("en", "slug", "guide"),
                ("en", "title", "Rust Guide"),
                ("en", "body", "ownership and borrowing"),
            ],
        );
        let hidden = seed.page(
            None,
            2,
            PageStatus::Hidden,
            &[("en", "slug", "faq"), ("en", "title", "FAQ"), ("en", "body", "lifetimes")],
        );
        seed.page(None, 3, PageStatus::Draft, &[("en", "slug", "wip"), ("en", "title", "Draft")]);
        seed.page(None, 4, PageStatus::Expired, &[("en", "slug", "old"), ("en", "title", "Old")]);
        (store, guide, hidden)
    }

    #[test]
    fn queryset_excludes_drafts_and_expired() {
        let (store, guide, hidden) = seeded();
        let settings = PageSettings::default();
        let index = PageIndex::new(&settings);
        let ids: Vec<i64> = index
            .index_queryset(&store)
            .expect("queryset")
            .iter()
            .map(|page| page.id)
            .collect();
        assert_eq!(ids, vec![guide, hidden]);
    }

    #[test]
    fn documents_render_through_text_template() {
        let (store, guide, _) = seeded();
        let settings = PageSettings::default();
        let temp = tempdir().expect("tempdir");
        let renderer = FileTemplateRenderer::new(temp.path());
        let index = PageIndex::new(&settings).with_renderer(&renderer);
        let page = store.page(guide).expect("page").expect("exists");

        let document = index.prepare(&store, &page).expect("prepare");
        assert_eq!(document.title, "Rust Guide");
        assert_eq!(document.url, "/guide");
        assert_eq!(document.text, "Rust Guide\nownership and borrowing");
        assert_eq!(document.content_hash.len(), 16);

        let plain = PageIndex::new(&settings).prepare(&store, &page).expect("prepare");
        assert_eq!(plain.text, document.text);
    }

    #[test]
    fn update_index_is_incremental() {
        let (mut store, guide, hidden) = seeded();
        let settings = PageSettings::default();
        let index = PageIndex::new(&settings);

        let first = index.update_index(&mut store).expect("first");
        assert_eq!(first.documents, 2);
        assert_eq!(first.written, 2);

        let second = index.update_index(&mut store).expect("second");
        assert_eq!(second.written, 0);
        assert_eq!(second.unchanged, 2);

        let seed = Seed {
            connection: store.connection(),
        };
        seed.content(guide, "en", "body", "fearless concurrency", "2030-01-01T00:00:00+00:00");
        seed.set(hidden, "status", "draft");
        let third = index.update_index(&mut store).expect("third");
        assert_eq!(third.written, 1);
        assert_eq!(third.removed, 1);

        let hits = search(store.connection(), "concurrency", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, guide);
        assert!(search(store.connection(), "lifetimes", 10).expect("search").is_empty());
    }

    #[test]
    fn search_matches_prefixes_and_ignores_blank_queries() {
        let (mut store, guide, _) = seeded();
        let settings = PageSettings::default();
        PageIndex::new(&settings)
            .rebuild_index(&mut store)
            .expect("rebuild");

        let hits = search(store.connection(), "owner", 10).expect("search");
        assert_eq!(hits.iter().map(|hit| hit.page_id).collect::<Vec<_>>(), vec![guide]);
        assert_eq!(hits[0].url, "/guide");
        assert!(search(store.connection(), "   ", 10).expect("search").is_empty());
    }

    #[test]
    fn like_fallback_matches_title_and_text() {
        let (mut store, guide, hidden) = seeded();
        let settings = PageSettings::default();
        PageIndex::new(&settings)
            .update_index(&mut store)
            .expect("index");

        let hits = search_like(store.connection(), "GUIDE", 10).expect("like");
        assert_eq!(hits.iter().map(|hit| hit.page_id).collect::<Vec<_>>(), vec![guide]);
        let hits = search_like(store.connection(), "lifetimes", 10).expect("like");
        assert_eq!(hits.iter().map(|hit| hit.page_id).collect::<Vec<_>>(), vec![hidden]);
    }
}
