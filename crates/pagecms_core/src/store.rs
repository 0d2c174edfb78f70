use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::db::{count_query, open_connection, table_exists};
use crate::http::{PageRequest, normalize_url};
use crate::model::{Content, Page, PageAlias, PageStatus, SLUG_CONTENT, TITLE_CONTENT};
use crate::runtime::{MIGRATIONS_POLICY_MESSAGE, ResolvedPaths};

/// Read access to the page tree.
pub trait PageStore {
    /// Page whose complete slug in `lang` equals `path`. The empty path is the first root page.
    fn from_path(&self, path: &str, lang: &str, exclude_drafts: bool) -> Result<Option<Page>>;

    /// Published root pages ordered by tree.
    fn navigation(&self) -> Result<Vec<Page>>;

    fn page(&self, id: i64) -> Result<Option<Page>>;

    /// Ancestors of `page`, root first.
    fn ancestors(&self, page: &Page) -> Result<Vec<Page>>;

    /// Latest content body of one type, falling back to the default language.
    fn content(&self, page: &Page, lang: &str, content_type: &str) -> Result<Option<String>>;

    /// Latest content of every type for `lang`, with default-language fallbacks filled in.
    fn contents(&self, page: &Page, lang: &str) -> Result<Vec<Content>>;

    fn pages_excluding(&self, statuses: &[PageStatus]) -> Result<Vec<Page>>;

    fn slug(&self, page: &Page, lang: &str) -> Result<String> {
        Ok(self.content(page, lang, SLUG_CONTENT)?.unwrap_or_default())
    }

    fn title(&self, page: &Page, lang: &str) -> Result<String> {
        Ok(self.content(page, lang, TITLE_CONTENT)?.unwrap_or_default())
    }

    fn complete_slug(&self, page: &Page, lang: &str) -> Result<String> {
        let mut slugs = Vec::new();
        for ancestor in self.ancestors(page)? {
            slugs.push(self.slug(&ancestor, lang)?);
        }
        slugs.push(self.slug(page, lang)?);
        Ok(slugs.join("/"))
    }

    fn url_path(&self, page: &Page, lang: &str, use_language_prefix: bool) -> Result<String> {
        let complete_slug = self.complete_slug(page, lang)?;
        if use_language_prefix {
            Ok(format!("/{lang}/{complete_slug}"))
        } else {
            Ok(format!("/{complete_slug}"))
        }
    }

    /// Own template, else the nearest ancestor's, else `default_template`.
    fn template(&self, page: &Page, default_template: &str) -> Result<String> {
        if let Some(template) = non_empty(page.template.as_deref()) {
            return Ok(template.to_string());
        }
        for ancestor in self.ancestors(page)?.iter().rev() {
            if let Some(template) = non_empty(ancestor.template.as_deref()) {
                return Ok(template.to_string());
            }
        }
        Ok(default_template.to_string())
    }
}

/// Lookup of alternate paths pointing at a canonical page.
pub trait AliasStore {
    fn from_path(&self, request: &PageRequest, path: &str, lang: &str)
    -> Result<Option<PageAlias>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub pages: usize,
    pub aliases: usize,
    pub contents: usize,
    pub by_status: BTreeMap<String, usize>,
}

const PAGE_COLUMNS: &str = "id, parent_id, tree_id, position, status, template, delegate_to,
    redirect_to_url, redirect_to_id, publication_date, publication_end_date, creation_date";

/// SQLite-backed page and alias store.
pub struct SqliteStore {
    connection: Connection,
    default_language: String,
}

impl SqliteStore {
    /// Open the migrated database at `paths.db_path`.
    pub fn open(paths: &ResolvedPaths, default_language: &str) -> Result<Self> {
        if !paths.db_path.exists() {
            bail!(
                "page database not found at {}. {MIGRATIONS_POLICY_MESSAGE}",
                paths.db_path.display()
            );
        }
        let connection = open_connection(&paths.db_path)?;
        Self::from_connection(connection, default_language)
    }

    pub fn from_connection(connection: Connection, default_language: &str) -> Result<Self> {
        if !table_exists(&connection, "pages")? {
            bail!("page tables are missing. {MIGRATIONS_POLICY_MESSAGE}");
        }
        Ok(Self {
            connection,
            default_language: default_language.to_string(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let pages = count_query(&self.connection, "SELECT COUNT(*) FROM pages")
            .context("failed to count pages")?;
        let aliases = count_query(&self.connection, "SELECT COUNT(*) FROM page_aliases")
            .context("failed to count aliases")?;
        let contents = count_query(&self.connection, "SELECT COUNT(*) FROM contents")
            .context("failed to count contents")?;

        let mut statement = self
            .connection
            .prepare("SELECT status, COUNT(*) FROM pages GROUP BY status ORDER BY status ASC")
            .context("failed to prepare status aggregation query")?;
        let rows = statement
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })
            .context("failed to run status aggregation query")?;
        let mut by_status = BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("failed to read status aggregation row")?;
            let count = usize::try_from(count).context("status count does not fit into usize")?;
            by_status.insert(status, count);
        }

        Ok(StoreStats {
            pages,
            aliases,
            contents,
            by_status,
        })
    }

    fn query_pages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Page>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .with_context(|| format!("failed to prepare page query: {sql}"))?;
        let mut rows = statement.query(params).context("failed to run page query")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context("failed to read page row")? {
            out.push(decode_page(row)?);
        }
        Ok(out)
    }

    fn first_root(&self, exclude_drafts: bool) -> Result<Option<Page>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE parent_id IS NULL AND (?1 = 0 OR status != 'draft')
             ORDER BY tree_id ASC, position ASC
             LIMIT 1"
        );
        Ok(self
            .query_pages(&sql, params![i64::from(exclude_drafts)])?
            .into_iter()
            .next())
    }

    fn latest_content(&self, page_id: i64, lang: &str, content_type: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT body FROM contents
                 WHERE page_id = ?1 AND language = ?2 AND content_type = ?3
                 ORDER BY creation_date DESC, id DESC
                 LIMIT 1",
                params![page_id, lang, content_type],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to load {content_type} content for page {page_id}"))
    }

    fn latest_contents(&self, page_id: i64, lang: &str) -> Result<Vec<Content>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT page_id, language, content_type, body, creation_date
                 FROM contents
                 WHERE page_id = ?1 AND language = ?2
                 ORDER BY content_type ASC, creation_date DESC, id DESC",
            )
            .context("failed to prepare contents query")?;
        let mut rows = statement
            .query(params![page_id, lang])
            .context("failed to run contents query")?;

        let mut out: Vec<Content> = Vec::new();
        while let Some(row) = rows.next().context("failed to read content row")? {
            let content_type: String = row.get(2).context("failed to decode content type")?;
            if out.last().is_some_and(|last| last.content_type == content_type) {
                continue;
            }
            let creation_date: String = row.get(4).context("failed to decode content date")?;
            out.push(Content {
                page_id: row.get(0).context("failed to decode content page id")?,
                language: row.get(1).context("failed to decode content language")?,
                content_type,
                body: row.get(3).context("failed to decode content body")?,
                creation_date: parse_timestamp(&creation_date)?,
            });
        }
        Ok(out)
    }
}

impl PageStore for SqliteStore {
    fn from_path(&self, path: &str, lang: &str, exclude_drafts: bool) -> Result<Option<Page>> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return self.first_root(exclude_drafts);
        }
        let slug = path.rsplit('/').next().unwrap_or(path);

        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE id IN (
                 SELECT page_id FROM contents
                 WHERE content_type = 'slug' AND body = ?1 AND language IN (?2, ?3)
             )
             AND (?4 = 0 OR status != 'draft')
             ORDER BY tree_id ASC, position ASC, id ASC"
        );
        let candidates = self.query_pages(
            &sql,
            params![slug, lang, self.default_language, i64::from(exclude_drafts)],
        )?;
        for candidate in candidates {
            if self.complete_slug(&candidate, lang)? == path {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn navigation(&self) -> Result<Vec<Page>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE parent_id IS NULL AND status = 'published'
             ORDER BY tree_id ASC, position ASC"
        );
        self.query_pages(&sql, [])
    }

    fn page(&self, id: i64) -> Result<Option<Page>> {
        let sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1");
        Ok(self.query_pages(&sql, params![id])?.into_iter().next())
    }

    fn ancestors(&self, page: &Page) -> Result<Vec<Page>> {
        let mut chain = Vec::new();
        let mut cursor = page.parent_id;
        while let Some(parent_id) = cursor {
            if parent_id == page.id || chain.iter().any(|seen: &Page| seen.id == parent_id) {
                bail!("page {} has a cyclic parent chain", page.id);
            }
            let parent = self
                .page(parent_id)?
                .ok_or_else(|| anyhow::anyhow!("page {} has a dangling parent {parent_id}", page.id))?;
            cursor = parent.parent_id;
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    fn content(&self, page: &Page, lang: &str, content_type: &str) -> Result<Option<String>> {
        if let Some(body) = self.latest_content(page.id, lang, content_type)? {
            return Ok(Some(body));
        }
        if lang != self.default_language {
            return self.latest_content(page.id, &self.default_language, content_type);
        }
        Ok(None)
    }

    fn contents(&self, page: &Page, lang: &str) -> Result<Vec<Content>> {
        let mut contents = self.latest_contents(page.id, lang)?;
        if lang != self.default_language {
            for fallback in self.latest_contents(page.id, &self.default_language)? {
                if !contents
                    .iter()
                    .any(|content| content.content_type == fallback.content_type)
                {
                    contents.push(fallback);
                }
            }
            contents.sort_by(|left, right| left.content_type.cmp(&right.content_type));
        }
        Ok(contents)
    }

    fn pages_excluding(&self, statuses: &[PageStatus]) -> Result<Vec<Page>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages ORDER BY tree_id ASC, parent_id ASC, position ASC, id ASC"
        );
        Ok(self
            .query_pages(&sql, [])?
            .into_iter()
            .filter(|page| !statuses.contains(&page.status))
            .collect())
    }
}

impl AliasStore for SqliteStore {
    fn from_path(
        &self,
        request: &PageRequest,
        path: &str,
        lang: &str,
    ) -> Result<Option<PageAlias>> {
        let url = normalize_url(path);
        let mut candidates = Vec::new();
        if let Some(query) = request.query_string.as_deref() {
            candidates.push(format!("{url}?{query}"));
        }
        candidates.push(url);

        for candidate in candidates {
            let alias = self
                .connection
                .query_row(
                    "SELECT id, page_id, url, language FROM page_aliases
                     WHERE url = ?1 AND (language IS NULL OR language = ?2)
                     ORDER BY language IS NULL ASC
                     LIMIT 1",
                    params![candidate, lang],
                    |row| {
                        Ok(PageAlias {
                            id: row.get(0)?,
                            page_id: row.get(1)?,
                            url: row.get(2)?,
                            language: row.get(3)?,
                        })
                    },
                )
                .optional()
                .with_context(|| format!("failed to look up alias {candidate}"))?;
            if alias.is_some() {
                return Ok(alias);
            }
        }
        Ok(None)
    }
}

fn decode_page(row: &Row<'_>) -> Result<Page> {
    let status: String = row.get(4).context("failed to decode page status")?;
    let publication_date: Option<String> =
        row.get(9).context("failed to decode publication date")?;
    let publication_end_date: Option<String> =
        row.get(10).context("failed to decode publication end date")?;
    let creation_date: String = row.get(11).context("failed to decode creation date")?;
    Ok(Page {
        id: row.get(0).context("failed to decode page id")?,
        parent_id: row.get(1).context("failed to decode parent id")?,
        tree_id: row.get(2).context("failed to decode tree id")?,
        position: row.get(3).context("failed to decode position")?,
        status: status.parse()?,
        template: row.get(5).context("failed to decode template")?,
        delegate_to: row.get(6).context("failed to decode delegate target")?,
        redirect_to_url: row.get(7).context("failed to decode redirect url")?,
        redirect_to_id: row.get(8).context("failed to decode redirect page id")?,
        publication_date: publication_date.as_deref().map(parse_timestamp).transpose()?,
        publication_end_date: publication_end_date
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        creation_date: parse_timestamp(&creation_date)?,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 timestamp {value:?}"))
}

pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}
