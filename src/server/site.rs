// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// What a resolved path serves as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Static markup, streamed as-is.
    Markup,
    /// Sandboxed handler script.
    Handler,
    /// Any other static file.
    Asset,
}

#[derive(Debug, Clone)]
pub struct ResolvedPage {
    pub disk_path: PathBuf,
    pub kind: PageKind,
    pub content_type: String,
}

/// One site's document root.
///
/// Resolution policy, in order: the exact file, the path with a `.rwml` or
/// `.lua` extension probed, then a directory index (`index.rwml`,
/// `index.lua`). Anything that would leave the root is refused.
#[derive(Debug, Clone)]
pub struct SiteRoot {
    root: PathBuf,
}

impl SiteRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn resolve(&self, url_path: &str) -> CoreResult<ResolvedPage> {
        let relative = self.safe_relative(url_path)?;
        let base = self.root.join(&relative);

        if is_file(&base).await {
            return Ok(page_for(base));
        }

        // A bare name probes the two first-class extensions.
        if base.extension().is_none() && !url_path.ends_with('/') {
            for ext in ["rwml", "lua"] {
                let candidate = base.with_extension(ext);
                if is_file(&candidate).await {
                    return Ok(page_for(candidate));
                }
            }
        }

        if is_dir(&base).await {
            for index in ["index.rwml", "index.lua"] {
                let candidate = base.join(index);
                if is_file(&candidate).await {
                    return Ok(page_for(candidate));
                }
            }
        }

        Err(CoreError::NotFound(url_path.to_string()))
    }

    pub async fn read(&self, page: &ResolvedPage) -> CoreResult<String> {
        let bytes = tokio::fs::read(&page.disk_path).await.map_err(|e| {
            CoreError::NotFound(format!(
                "{}: {e}",
                page.disk_path.to_string_lossy()
            ))
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Normalizes the URL path into a root-relative path, refusing any
    /// traversal attempt.
    fn safe_relative(&self, url_path: &str) -> CoreResult<PathBuf> {
        let mut out = PathBuf::new();
        for segment in url_path.split('/') {
            match segment {
                "" | "." => {},
                ".." => {
                    return Err(CoreError::NotFound(url_path.to_string()));
                },
                seg if seg.contains('\\') || seg.contains('\0') => {
                    return Err(CoreError::NotFound(url_path.to_string()));
                },
                seg => out.push(seg),
            }
        }
        Ok(out)
    }
}

fn page_for(disk_path: PathBuf) -> ResolvedPage {
    let ext = disk_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let (kind, content_type) = match ext.as_str() {
        "rwml" => (PageKind::Markup, "text/rwml"),
        "lua" => (PageKind::Handler, "text/x-handler"),
        "txt" => (PageKind::Asset, "text/plain"),
        "json" => (PageKind::Asset, "application/json"),
        "nft" | "nfp" => (PageKind::Asset, "image/paint"),
        _ => (PageKind::Asset, "application/octet-stream"),
    };
    ResolvedPage {
        disk_path,
        kind,
        content_type: content_type.to_string(),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture_site() -> (tempdir_like::TempRoot, SiteRoot) {
        let root = tempdir_like::TempRoot::new("site-resolve");
        tokio::fs::create_dir_all(root.path().join("private"))
            .await
            .expect("mkdir");
        for (name, body) in [
            ("index.rwml", "# Home"),
            ("about.rwml", "# About"),
            ("app.lua", "print(1)"),
            ("robots.txt", "User-agent: *"),
            ("private/secret.rwml", "# Secret"),
        ] {
            tokio::fs::write(root.path().join(name), body)
                .await
                .expect("write");
        }
        let site = SiteRoot::new(root.path());
        (root, site)
    }

    /// Minimal unique-dir helper so tests do not depend on an external
    /// tempfile crate.
    mod tempdir_like {
        use std::path::{Path, PathBuf};

        pub struct TempRoot(PathBuf);

        impl TempRoot {
            pub fn new(tag: &str) -> Self {
                let dir = std::env::temp_dir().join(format!(
                    "rednet-{tag}-{}",
                    crate::utils::random_token(8)
                ));
                std::fs::create_dir_all(&dir).expect("temp dir");
                Self(dir)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempRoot {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn test_directory_index() {
        let (_guard, site) = fixture_site().await;
        let page = site.resolve("/").await.expect("resolve");
        assert_eq!(page.kind, PageKind::Markup);
        assert!(page.disk_path.ends_with("index.rwml"));
    }

    #[tokio::test]
    async fn test_extension_probe() {
        let (_guard, site) = fixture_site().await;
        let page = site.resolve("/about").await.expect("resolve");
        assert!(page.disk_path.ends_with("about.rwml"));

        let page = site.resolve("/app").await.expect("resolve");
        assert_eq!(page.kind, PageKind::Handler);
        assert_eq!(page.content_type, "text/x-handler");
    }

    #[tokio::test]
    async fn test_exact_asset_and_404() {
        let (_guard, site) = fixture_site().await;
        let page = site.resolve("/robots.txt").await.expect("resolve");
        assert_eq!(page.kind, PageKind::Asset);
        assert_eq!(page.content_type, "text/plain");

        assert!(matches!(
            site.resolve("/missing").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_refused() {
        let (_guard, site) = fixture_site().await;
        assert!(site.resolve("/../etc/passwd").await.is_err());
    }
}
