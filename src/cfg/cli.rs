// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Like [`resolve_config_path`], but a missing file is not an error: the
/// caller falls back to built-in defaults.
pub fn resolve_optional_config_path(rel: &str) -> Result<Option<PathBuf>> {
    let p = Path::new(rel);
    if !p.exists() {
        return Ok(None);
    }
    resolve_config_path(rel).map(Some)
}
