//! Page resolution, rendering and search indexing for a hierarchical CMS.

pub mod config;
pub mod db;
pub mod error;
pub mod fixtures;
pub mod http;
pub mod migrate;
pub mod model;
pub mod render;
pub mod runtime;
pub mod search;
pub mod store;
pub mod template;
pub mod urlconf;
pub mod views;

pub use config::{PageSettings, PagesConfig, load_config};
pub use error::{PageError, PageResult};
pub use http::{Context, PageRequest, PageResponse, User};
pub use model::{Page, PageAlias, PageStatus};
pub use render::{AutoRender, FileTemplateRenderer, Rendered, TemplateRenderer};
pub use store::{AliasStore, PageStore, SqliteStore};
pub use urlconf::{Urlconf, UrlconfRegistry};
pub use views::Details;
