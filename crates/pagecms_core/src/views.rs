use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::config::PageSettings;
use crate::error::{PageError, PageResult};
use crate::http::{
    Context, PageRequest, PageResponse, get_language_from_request, remove_slug,
    split_language_prefix,
};
use crate::model::Page;
use crate::store::{AliasStore, PageStore, format_timestamp};
use crate::urlconf::UrlconfRegistry;

/// Page resolver: maps a request path onto a page and what to do with it.
///
/// Resolution runs language normalization, navigation lookup, progressive
/// path matching, alias fallback, visibility and redirection checks,
/// template selection, extra context and finally delegation to a
/// registered sub-application urlconf.
pub struct Details<'a> {
    pages: &'a dyn PageStore,
    aliases: &'a dyn AliasStore,
    settings: &'a PageSettings,
    urlconfs: Option<&'a UrlconfRegistry>,
    now: Option<DateTime<Utc>>,
}

impl<'a> Details<'a> {
    pub fn new(
        pages: &'a dyn PageStore,
        aliases: &'a dyn AliasStore,
        settings: &'a PageSettings,
    ) -> Self {
        Self {
            pages,
            aliases,
            settings,
            urlconfs: None,
            now: None,
        }
    }

    pub fn with_urlconfs(mut self, urlconfs: &'a UrlconfRegistry) -> Self {
        self.urlconfs = Some(urlconfs);
        self
    }

    /// Pin the clock used for publication-window checks.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn settings(&self) -> &PageSettings {
        self.settings
    }

    pub fn resolve(
        &self,
        request: &PageRequest,
        path: Option<&str>,
        lang: Option<&str>,
        delegation: bool,
    ) -> PageResult<PageResponse> {
        let Some(path) = path else {
            return Err(PageError::configuration(
                "page resolution requires the path argument; check the route wiring",
            ));
        };
        let mut path = path.trim_start_matches('/').to_string();
        let mut lang = lang.map(str::to_string);

        if self.settings.use_language_prefix
            && lang.is_none()
            && let Some((prefix, rest)) = split_language_prefix(&path, &self.settings.language_keys())
        {
            lang = Some(prefix.to_string());
            path = rest.to_string();
        }

        let lang = self.choose_language(lang.as_deref(), request)?;
        let mut context = Context::new();
        context.insert("path".to_string(), Value::from(path.as_str()));
        context.insert("lang".to_string(), Value::from(lang.as_str()));
        context.insert(
            "pages_navigation".to_string(),
            self.get_navigation(&lang)?,
        );

        let is_staff = request.is_staff();
        let Some(current_page) = self.resolve_page(&path, &lang, is_staff)? else {
            return self.resolve_alias(request, &path, &lang, is_staff);
        };
        context.insert(
            "current_page".to_string(),
            self.page_context(&current_page, &lang)?,
        );

        if !is_staff && !current_page.is_visible(self.settings, self.now()) {
            return Err(PageError::not_found(format!(
                "page {} is not visible",
                current_page.id
            )));
        }

        if let Some(redirect) = self.resolve_redirection(&current_page, &lang)? {
            return Ok(redirect);
        }

        let mut template = self.get_template(&current_page)?;
        if request.is_ajax() {
            template = format!("body_{template}");
        }

        self.extra_context(&mut context);

        if delegation
            && current_page.delegate_to.is_some()
            && let Some(answer) = self.delegate(request, &current_page, &context)?
        {
            return Ok(answer);
        }

        Ok(PageResponse::Render { template, context })
    }

    /// Explicit language, else negotiated from the request; unknown keys are a 404.
    pub fn choose_language(&self, lang: Option<&str>, request: &PageRequest) -> PageResult<String> {
        let lang = match lang.filter(|lang| !lang.is_empty()) {
            Some(lang) => lang.to_string(),
            None => get_language_from_request(request, self.settings),
        };
        if !self.settings.has_language(&lang) {
            return Err(PageError::not_found(format!("unknown language {lang:?}")));
        }
        Ok(lang)
    }

    pub fn get_navigation(&self, lang: &str) -> PageResult<Value> {
        let mut entries = Vec::new();
        for page in self.pages.navigation()? {
            entries.push(json!({
                "id": page.id,
                "title": self.pages.title(&page, lang)?,
                "slug": self.pages.slug(&page, lang)?,
                "url": self.pages.url_path(&page, lang, self.settings.use_language_prefix)?,
            }));
        }
        Ok(Value::Array(entries))
    }

    /// Probe `path`, then each parent path, until a page matches.
    pub fn resolve_page(&self, path: &str, lang: &str, is_staff: bool) -> PageResult<Option<Page>> {
        let mut probe = Some(path.to_string());
        while let Some(candidate) = probe {
            if let Some(page) = self.pages.from_path(&candidate, lang, !is_staff)? {
                return Ok(Some(page));
            }
            if !is_staff && self.pages.from_path(&candidate, lang, false)?.is_some() {
                return Err(PageError::not_found(format!("{candidate:?} is a draft")));
            }
            probe = remove_slug(&candidate);
        }
        Ok(None)
    }

    fn resolve_alias(
        &self,
        request: &PageRequest,
        path: &str,
        lang: &str,
        is_staff: bool,
    ) -> PageResult<PageResponse> {
        let Some(alias) = self.aliases.from_path(request, path, lang)? else {
            return Err(PageError::not_found(format!("no page or alias for {path:?}")));
        };
        let Some(page) = self.pages.page(alias.page_id)? else {
            return Err(PageError::not_found(format!(
                "alias {} points at missing page {}",
                alias.url, alias.page_id
            )));
        };
        if !is_staff && !page.is_visible(self.settings, self.now()) {
            return Err(PageError::not_found(format!(
                "alias {} points at hidden page {}",
                alias.url, page.id
            )));
        }
        let url = self
            .pages
            .url_path(&page, lang, self.settings.use_language_prefix)?;
        Ok(PageResponse::redirect(url))
    }

    fn resolve_redirection(&self, page: &Page, lang: &str) -> PageResult<Option<PageResponse>> {
        if let Some(url) = page.redirect_to_url.as_deref().filter(|url| !url.is_empty()) {
            return Ok(Some(PageResponse::redirect(url)));
        }
        if let Some(target_id) = page.redirect_to_id
            && let Some(target) = self.pages.page(target_id)?
        {
            let url = self
                .pages
                .url_path(&target, lang, self.settings.use_language_prefix)?;
            return Ok(Some(PageResponse::redirect(url)));
        }
        Ok(None)
    }

    pub fn get_template(&self, page: &Page) -> PageResult<String> {
        Ok(self.pages.template(page, &self.settings.default_template)?)
    }

    fn extra_context(&self, context: &mut Context) {
        if let Some(producer) = &self.settings.extra_context {
            context.extend(producer());
        }
    }

    fn delegate(
        &self,
        request: &PageRequest,
        page: &Page,
        context: &Context,
    ) -> PageResult<Option<PageResponse>> {
        let (Some(target), Some(registry)) = (page.delegate_to.as_deref(), self.urlconfs) else {
            return Ok(None);
        };
        let Some(urlconf) = registry.get_urlconf(target) else {
            return Ok(None);
        };

        let lang = context.get("lang").and_then(Value::as_str).unwrap_or_default();
        let path = context.get("path").and_then(Value::as_str).unwrap_or_default();
        let complete_slug = self.pages.complete_slug(page, lang)?;
        let Some(matched) = urlconf.resolve(&delegate_path(path, &complete_slug)) else {
            return Ok(None);
        };

        let mut kwargs = matched.kwargs;
        kwargs.extend(context.clone());
        (matched.view)(request, &matched.args, kwargs)
    }

    fn page_context(&self, page: &Page, lang: &str) -> PageResult<Value> {
        let mut contents = Map::new();
        for content in self.pages.contents(page, lang)? {
            contents.insert(content.content_type, Value::from(content.body));
        }
        Ok(json!({
            "id": page.id,
            "title": self.pages.title(page, lang)?,
            "slug": self.pages.slug(page, lang)?,
            "complete_slug": self.pages.complete_slug(page, lang)?,
            "url": self.pages.url_path(page, lang, self.settings.use_language_prefix)?,
            "template": self.get_template(page)?,
            "status": page.calculated_status(self.settings, self.now()).as_str(),
            "publication_date": page.publication_date.as_ref().map(format_timestamp),
            "delegate_to": page.delegate_to,
            "contents": contents,
        }))
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }
}

/// Sub-path handed to a delegate: the path below the page's complete slug, rooted at `/`.
pub fn delegate_path(path: &str, complete_slug: &str) -> String {
    let path = path.trim_matches('/');
    let rest = match path.strip_prefix(complete_slug) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => "",
    };
    format!("/{}", rest.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::config::LanguageEntry;
    use crate::model::PageStatus;
    use crate::store::SqliteStore;
    use crate::store::tests::{Seed, memory_store};
    use crate::urlconf::Urlconf;

    fn bilingual() -> PageSettings {
        PageSettings {
            languages: vec![
                LanguageEntry::new("en", "English"),
                LanguageEntry::new("fr", "Français"),
            ],
            ..PageSettings::default()
        }
    }

    fn render_parts(response: PageResponse) -> (String, Context) {
        match response {
            PageResponse::Render { template, context } => (template, context),
            other => panic!("expected render, got {other:?}"),
        }
    }

    fn current_page_id(context: &Context) -> Option<i64> {
        context.get("current_page")?.get("id")?.as_i64()
    }

    /// `docs` > `guide`, plus a `blog` root delegating to `blog`.
    fn site() -> (SqliteStore, i64, i64, i64) {
        let store = memory_store();
        let seed = Seed {
            connection: store.connection(),
        };
        let docs = seed.page(
            None,
            1,
            PageStatus::Published,
            &[
                ("en", "slug", "docs"),
                ("en", "title", "Docs"),
                ("fr", "slug", "documentation"),
            ],
        );
        let guide = seed.page(
            Some(docs),
            1,
            PageStatus::Published,
            &[("en", "slug", "guide"), ("en", "body", "<p>read me</p>")],
        );
        let blog = seed.page(
            None,
            2,
            PageStatus::Published,
            &[("en", "slug", "blog"), ("en", "title", "Blog")],
        );
        seed.set(blog, "delegate_to", "blog");
        (store, docs, guide, blog)
    }

    #[test]
    fn missing_path_is_a_configuration_error() {
        let (store, ..) = site();
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);
        let error = details
            .resolve(&PageRequest::new("/"), None, None, true)
            .expect_err("must fail");
        assert!(matches!(error, PageError::Configuration(_)));
    }

    #[test]
    fn exact_path_renders_with_navigation() {
        let (store, docs, guide, blog) = site();
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);

        let response = details
            .resolve(&PageRequest::new("/docs/guide"), Some("docs/guide"), Some("en"), true)
            .expect("resolve");
        let (template, context) = render_parts(response);
        assert_eq!(template, "pages/base.html");
        assert_eq!(current_page_id(&context), Some(guide));
        assert_eq!(context.get("lang"), Some(&Value::from("en")));
        assert_eq!(context.get("path"), Some(&Value::from("docs/guide")));

        let navigation = context["pages_navigation"].as_array().expect("navigation");
        let ids: Vec<i64> = navigation.iter().filter_map(|item| item["id"].as_i64()).collect();
        assert_eq!(ids, vec![docs, blog]);
        assert_eq!(navigation[0]["url"], Value::from("/docs"));

        let current = &context["current_page"];
        assert_eq!(current["complete_slug"], Value::from("docs/guide"));
        assert_eq!(current["contents"]["body"], Value::from("<p>read me</p>"));
    }

    #[test]
    fn unknown_tail_falls_back_to_deepest_ancestor() {
        let (store, _, guide, _) = site();
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);
        let response = details
            .resolve(&PageRequest::new("/"), Some("docs/guide/extra/deep"), Some("en"), true)
            .expect("resolve");
        let (_, context) = render_parts(response);
        assert_eq!(current_page_id(&context), Some(guide));
    }

    #[test]
    fn unmatched_path_without_alias_is_not_found() {
        let (store, ..) = site();
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);
        let error = details
            .resolve(&PageRequest::new("/"), Some("nowhere/at/all"), Some("en"), true)
            .expect_err("must fail");
        assert!(error.is_not_found());
    }

    #[test]
    fn alias_redirects_to_canonical_url() {
        let (store, _, guide, _) = site();
        Seed {
            connection: store.connection(),
        }
        .alias(guide, "/old-path", None);
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);

        let response = details
            .resolve(&PageRequest::new("/old-path"), Some("old-path"), Some("en"), true)
            .expect("resolve");
        assert_eq!(response, PageResponse::redirect("/docs/guide"));
    }

    #[test]
    fn alias_to_draft_is_hidden_from_visitors() {
        let (store, ..) = site();
        let seed = Seed {
            connection: store.connection(),
        };
        let draft = seed.page(None, 3, PageStatus::Draft, &[("en", "slug", "secret")]);
        seed.alias(draft, "/teaser", None);
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);

        let visitor = PageRequest::new("/teaser");
        let error = details
            .resolve(&visitor, Some("teaser"), Some("en"), true)
            .expect_err("must fail");
        assert!(error.is_not_found());

        let staff = PageRequest::new("/teaser").with_user(crate::http::User::staff());
        let response = details
            .resolve(&staff, Some("teaser"), Some("en"), true)
            .expect("resolve");
        assert_eq!(response, PageResponse::redirect("/secret"));
    }

    #[test]
    fn drafts_are_not_found_for_visitors_but_served_to_staff() {
        let (store, docs, _, _) = site();
        let seed = Seed {
            connection: store.connection(),
        };
        let draft = seed.page(Some(docs), 1, PageStatus::Draft, &[("en", "slug", "upcoming")]);
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);

        let error = details
            .resolve(&PageRequest::new("/"), Some("docs/upcoming"), Some("en"), true)
            .expect_err("must fail");
        assert!(error.is_not_found());

        let staff = PageRequest::new("/").with_user(crate::http::User::staff());
        let (_, context) = render_parts(
            details
                .resolve(&staff, Some("docs/upcoming"), Some("en"), true)
                .expect("resolve"),
        );
        assert_eq!(current_page_id(&context), Some(draft));
    }

    #[test]
    fn expired_pages_are_not_found_for_visitors() {
        let (store, ..) = site();
        let seed = Seed {
            connection: store.connection(),
        };
        let page = seed.page(None, 3, PageStatus::Published, &[("en", "slug", "sale")]);
        seed.set(page, "publication_end_date", "2024-01-01T00:00:00+00:00");
        let settings = PageSettings {
            show_end_date: true,
            ..PageSettings::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let details = Details::new(&store, &store, &settings).with_now(now);

        let error = details
            .resolve(&PageRequest::new("/"), Some("sale"), Some("en"), true)
            .expect_err("must fail");
        assert!(error.is_not_found());

        let earlier = Details::new(&store, &store, &settings).with_now(now - Duration::days(365));
        assert!(earlier
            .resolve(&PageRequest::new("/"), Some("sale"), Some("en"), true)
            .is_ok());
    }

    #[test]
    fn stored_expired_status_hides_exact_match_from_visitors() {
        let (store, docs, _, _) = site();
        let seed = Seed {
            connection: store.connection(),
        };
        let retired = seed.page(Some(docs), 1, PageStatus::Expired, &[("en", "slug", "retired")]);
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);

        let error = details
            .resolve(&PageRequest::new("/"), Some("docs/retired"), Some("en"), true)
            .expect_err("must fail");
        assert!(error.is_not_found());

        let staff = PageRequest::new("/").with_user(crate::http::User::staff());
        let (_, context) = render_parts(
            details
                .resolve(&staff, Some("docs/retired"), Some("en"), true)
                .expect("resolve"),
        );
        assert_eq!(current_page_id(&context), Some(retired));
    }

    #[test]
    fn redirect_to_url_wins_over_redirect_to_page() {
        let (store, docs, guide, _) = site();
        let seed = Seed {
            connection: store.connection(),
        };
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);

        seed.set(docs, "redirect_to_id", &guide.to_string());
        let response = details
            .resolve(&PageRequest::new("/"), Some("docs"), Some("en"), true)
            .expect("resolve");
        assert_eq!(response, PageResponse::redirect("/docs/guide"));

        seed.set(docs, "redirect_to_url", "https://example.org/manual");
        let response = details
            .resolve(&PageRequest::new("/"), Some("docs"), Some("en"), true)
            .expect("resolve");
        assert_eq!(response, PageResponse::redirect("https://example.org/manual"));
    }

    #[test]
    fn language_prefix_is_split_off_the_path() {
        let (store, docs, ..) = site();
        let settings = PageSettings {
            use_language_prefix: true,
            ..bilingual()
        };
        let details = Details::new(&store, &store, &settings);

        let (_, context) = render_parts(
            details
                .resolve(&PageRequest::new("/fr/documentation"), Some("fr/documentation"), None, true)
                .expect("resolve"),
        );
        assert_eq!(context.get("lang"), Some(&Value::from("fr")));
        assert_eq!(context.get("path"), Some(&Value::from("documentation")));
        assert_eq!(current_page_id(&context), Some(docs));
        assert_eq!(context["current_page"]["url"], Value::from("/fr/documentation"));
    }

    #[test]
    fn language_is_negotiated_and_validated() {
        let (store, ..) = site();
        let settings = bilingual();
        let details = Details::new(&store, &store, &settings);

        let request = PageRequest::new("/").with_header("Accept-Language", "fr-CA,en;q=0.5");
        let (_, context) = render_parts(
            details
                .resolve(&request, Some("documentation"), None, true)
                .expect("resolve"),
        );
        assert_eq!(context.get("lang"), Some(&Value::from("fr")));

        let error = details
            .resolve(&PageRequest::new("/"), Some("docs"), Some("de"), true)
            .expect_err("must fail");
        assert!(error.is_not_found());
    }

    #[test]
    fn ajax_requests_use_body_template() {
        let (store, ..) = site();
        let settings = PageSettings::default();
        let details = Details::new(&store, &store, &settings);
        let request = PageRequest::new("/docs").with_header("X-Requested-With", "XMLHttpRequest");
        let (template, _) = render_parts(
            details
                .resolve(&request, Some("docs"), Some("en"), true)
                .expect("resolve"),
        );
        assert_eq!(template, "body_pages/base.html");
    }

    #[test]
    fn extra_context_overrides_existing_keys() {
        let (store, ..) = site();
        let settings = PageSettings::default().with_extra_context(|| {
            let mut extra = Map::new();
            extra.insert("site_name".to_string(), Value::from("Example"));
            extra.insert("path".to_string(), Value::from("overridden"));
            extra
        });
        let details = Details::new(&store, &store, &settings);
        let (_, context) = render_parts(
            details
                .resolve(&PageRequest::new("/"), Some("docs"), Some("en"), true)
                .expect("resolve"),
        );
        assert_eq!(context.get("site_name"), Some(&Value::from("Example")));
        assert_eq!(context.get("path"), Some(&Value::from("overridden")));
    }

    fn blog_registry() -> UrlconfRegistry {
        let urlconf = Urlconf::new()
            .route(r"^(?P<year>\d{4})/(?P<month>\d{2})$", "archive", |_, _, kwargs| {
                let year = kwargs.get("year").and_then(Value::as_str).unwrap_or_default();
                let lang = kwargs.get("lang").and_then(Value::as_str).unwrap_or_default();
                Ok(Some(PageResponse::html(format!("archive {year} ({lang})"))))
            })
            .expect("route")
            .route(r"^drafts$", "drafts", |_, _, _| Ok(None))
            .expect("route");
        let mut registry = UrlconfRegistry::new();
        registry.register("blog", urlconf);
        registry
    }

    #[test]
    fn delegation_returns_sub_view_response() {
        let (store, ..) = site();
        let settings = PageSettings::default();
        let registry = blog_registry();
        let details = Details::new(&store, &store, &settings).with_urlconfs(&registry);

        let response = details
            .resolve(&PageRequest::new("/blog/2010/05"), Some("blog/2010/05"), Some("en"), true)
            .expect("resolve");
        assert_eq!(response, PageResponse::html("archive 2010 (en)"));
    }

    #[test]
    fn delegation_misses_fall_through_to_page_template() {
        let (store, _, _, blog) = site();
        let settings = PageSettings::default();
        let registry = blog_registry();
        let details = Details::new(&store, &store, &settings).with_urlconfs(&registry);

        for path in ["blog", "blog/unknown", "blog/drafts"] {
            let (_, context) = render_parts(
                details
                    .resolve(&PageRequest::new("/"), Some(path), Some("en"), true)
                    .expect("resolve"),
            );
            assert_eq!(current_page_id(&context), Some(blog), "{path}");
        }

        let (_, context) = render_parts(
            details
                .resolve(&PageRequest::new("/"), Some("blog/2010/05"), Some("en"), false)
                .expect("resolve"),
        );
        assert_eq!(current_page_id(&context), Some(blog));
    }

    #[test]
    fn delegate_path_is_rooted_below_the_complete_slug() {
        assert_eq!(delegate_path("blog/2010/05", "blog"), "/2010/05");
        assert_eq!(delegate_path("blog", "blog"), "/");
        assert_eq!(delegate_path("/news/blog/x/", "news/blog"), "/x");
        assert_eq!(delegate_path("blogger/x", "blog"), "/");
    }
}
