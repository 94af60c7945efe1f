//! Source acquisition: download, checksum, extract, or copy a local tree.
//!
//! Downloads land in a shared cache directory keyed by checksum, so repeated
//! builds of the same recipe never refetch.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::recipe::SourceSpec;

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("failed to download {url}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("download of {url} returned status {status}")]
  Status { url: String, status: u16 },
  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  HashMismatch {
    url: String,
    expected: String,
    actual: String,
  },
  #[error("cannot extract {name}: unsupported archive format")]
  UnsupportedArchive { name: String },
  #[error("archive does not contain directory {dir:?}")]
  MissingExtractDir { dir: String },
  #[error("local source {path} does not exist")]
  MissingLocalSource { path: PathBuf },
  #[error("zip error in {path}")]
  Zip {
    path: PathBuf,
    #[source]
    source: zip::result::ZipError,
  },
  #[error("io error at {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
  move |source| FetchError::Io {
    path: path.into(),
    source,
  }
}

/// Materializes a recipe's sources at `dest`. `recipe_dir` anchors relative
/// `path` sources; `cache_dir` holds verified downloads.
pub async fn prepare_source(
  spec: &SourceSpec,
  recipe_dir: &Path,
  cache_dir: &Path,
  dest: &Path,
) -> Result<(), FetchError> {
  if let Some(url) = &spec.url {
    let expected = spec
      .sha256
      .as_deref()
      .unwrap_or_default()
      .to_ascii_lowercase();
    let archive = fetch_cached(url, &expected, cache_dir).await?;
    extract_archive(&archive, dest, spec.extract_dir.as_deref())?;
  } else if let Some(path) = &spec.path {
    let src = recipe_dir.join(path);
    if !src.is_dir() {
      return Err(FetchError::MissingLocalSource { path: src });
    }
    copy_tree(&src, dest)?;
  } else {
    // Script-only recipe; it still gets a working directory.
    std::fs::create_dir_all(dest).map_err(io_err(dest))?;
  }
  Ok(())
}

/// Returns the cached archive path, downloading and verifying it first if
/// needed.
async fn fetch_cached(
  url: &str,
  expected_sha256: &str,
  cache_dir: &Path,
) -> Result<PathBuf, FetchError> {
  std::fs::create_dir_all(cache_dir).map_err(io_err(cache_dir))?;
  let name = url.rsplit('/').next().unwrap_or("source");
  let cached = cache_dir.join(format!("{}-{name}", &expected_sha256[..12.min(expected_sha256.len())]));
  if cached.is_file() {
    debug!(url, cached = %cached.display(), "using cached download");
    return Ok(cached);
  }

  info!(url, "downloading");
  let response = reqwest::get(url).await.map_err(|source| FetchError::Http {
    url: url.into(),
    source,
  })?;
  if !response.status().is_success() {
    return Err(FetchError::Status {
      url: url.into(),
      status: response.status().as_u16(),
    });
  }
  let bytes = response.bytes().await.map_err(|source| FetchError::Http {
    url: url.into(),
    source,
  })?;

  let actual = hex::encode(Sha256::digest(&bytes));
  if actual != expected_sha256 {
    return Err(FetchError::HashMismatch {
      url: url.into(),
      expected: expected_sha256.into(),
      actual,
    });
  }
  // A torn write must never appear under the final name; later runs trust
  // the name without re-hashing.
  let mut staging = tempfile::NamedTempFile::new_in(cache_dir).map_err(io_err(cache_dir))?;
  staging.write_all(&bytes).map_err(io_err(&cached))?;
  staging.persist(&cached).map_err(|e| FetchError::Io {
    path: cached.clone(),
    source: e.error,
  })?;
  Ok(cached)
}

/// Unpacks `archive` so its contents end up directly under `dest`. A single
/// top-level directory (or the named `extract_dir`) is flattened away.
pub fn extract_archive(
  archive: &Path,
  dest: &Path,
  extract_dir: Option<&str>,
) -> Result<(), FetchError> {
  let parent = dest.parent().unwrap_or(Path::new("."));
  std::fs::create_dir_all(parent).map_err(io_err(parent))?;
  let staging = tempfile::tempdir_in(parent).map_err(io_err(parent))?;

  let name = archive
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();
  let file = std::fs::File::open(archive).map_err(io_err(archive))?;
  if name.ends_with(".zip") {
    let mut zip = zip::ZipArchive::new(file).map_err(|source| FetchError::Zip {
      path: archive.into(),
      source,
    })?;
    zip.extract(staging.path()).map_err(|source| FetchError::Zip {
      path: archive.into(),
      source,
    })?;
  } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    tar.unpack(staging.path()).map_err(io_err(archive))?;
  } else if name.ends_with(".tar") {
    let mut tar = tar::Archive::new(file);
    tar.unpack(staging.path()).map_err(io_err(archive))?;
  } else {
    return Err(FetchError::UnsupportedArchive { name });
  }

  let root = match extract_dir {
    Some(dir) => {
      let root = staging.path().join(dir);
      if !root.is_dir() {
        return Err(FetchError::MissingExtractDir { dir: dir.into() });
      }
      root
    }
    None => single_toplevel_dir(staging.path()).unwrap_or_else(|| staging.path().into()),
  };

  std::fs::create_dir_all(dest).map_err(io_err(dest))?;
  for entry in std::fs::read_dir(&root).map_err(io_err(&root))? {
    let entry = entry.map_err(io_err(&root))?;
    let target = dest.join(entry.file_name());
    std::fs::rename(entry.path(), &target).map_err(io_err(&target))?;
  }
  Ok(())
}

fn single_toplevel_dir(path: &Path) -> Option<PathBuf> {
  let mut entries = std::fs::read_dir(path).ok()?;
  let first = entries.next()?.ok()?;
  if entries.next().is_some() || !first.path().is_dir() {
    return None;
  }
  Some(first.path())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), FetchError> {
  for entry in walkdir::WalkDir::new(src) {
    let entry = entry.map_err(|e| FetchError::Io {
      path: src.into(),
      source: e.into(),
    })?;
    let Ok(rel) = entry.path().strip_prefix(src) else {
      continue;
    };
    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target).map_err(io_err(&target))?;
    } else {
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
      }
      std::fs::copy(entry.path(), &target).map_err(io_err(&target))?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn make_tar_gz(path: &Path, entries: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut tar = tar::Builder::new(gz);
    for (name, contents) in entries {
      let mut header = tar::Header::new_gnu();
      header.set_size(contents.len() as u64);
      header.set_mode(0o644);
      header.set_cksum();
      tar.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    tar.into_inner().unwrap().finish().unwrap().flush().unwrap();
  }

  #[test]
  fn extracts_and_flattens_single_toplevel_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("pkg-1.0.tar.gz");
    make_tar_gz(
      &archive,
      &[("pkg-1.0/configure", "#!/bin/sh\n"), ("pkg-1.0/src/main.c", "int main;")],
    );
    let dest = tmp.path().join("src");
    extract_archive(&archive, &dest, None).unwrap();
    assert!(dest.join("configure").is_file());
    assert!(dest.join("src/main.c").is_file());
  }

  #[test]
  fn extract_dir_picks_the_named_root() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("pkg.tar.gz");
    make_tar_gz(&archive, &[("inner/file.txt", "x"), ("other.txt", "y")]);
    let dest = tmp.path().join("src");
    extract_archive(&archive, &dest, Some("inner")).unwrap();
    assert!(dest.join("file.txt").is_file());
    assert!(!dest.join("other.txt").exists());
  }

  #[test]
  fn missing_extract_dir_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("pkg.tar.gz");
    make_tar_gz(&archive, &[("inner/file.txt", "x")]);
    let err = extract_archive(&archive, &tmp.path().join("src"), Some("nope"));
    assert!(matches!(err, Err(FetchError::MissingExtractDir { .. })));
  }

  #[test]
  fn unsupported_archive_format_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("pkg.rar");
    std::fs::write(&archive, b"not an archive").unwrap();
    let err = extract_archive(&archive, &tmp.path().join("src"), None);
    assert!(matches!(err, Err(FetchError::UnsupportedArchive { .. })));
  }

  #[tokio::test]
  async fn complete_cache_entry_is_used_without_refetching() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("pkg-1.0.tar.gz");
    make_tar_gz(&archive, &[("pkg-1.0/main.c", "int main;")]);
    let bytes = std::fs::read(&archive).unwrap();
    let sha = hex::encode(Sha256::digest(&bytes));

    let cache = tmp.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::rename(&archive, cache.join(format!("{}-pkg-1.0.tar.gz", &sha[..12]))).unwrap();

    // The host never resolves; only the cache can satisfy this.
    let spec = SourceSpec {
      url: Some("https://example.invalid/pkg-1.0.tar.gz".into()),
      sha256: Some(sha),
      ..Default::default()
    };
    let dest = tmp.path().join("work/src");
    prepare_source(&spec, tmp.path(), &cache, &dest).await.unwrap();
    assert!(dest.join("main.c").is_file());
  }

  #[tokio::test]
  async fn local_path_source_is_copied() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    std::fs::create_dir_all(recipe_dir.join("src/sub")).unwrap();
    std::fs::write(recipe_dir.join("src/build.sh"), "make\n").unwrap();
    std::fs::write(recipe_dir.join("src/sub/a.c"), "int a;").unwrap();

    let spec = SourceSpec {
      path: Some(PathBuf::from("src")),
      ..Default::default()
    };
    let dest = tmp.path().join("work/src");
    prepare_source(&spec, &recipe_dir, &tmp.path().join("cache"), &dest)
      .await
      .unwrap();
    assert!(dest.join("build.sh").is_file());
    assert!(dest.join("sub/a.c").is_file());
  }

  #[tokio::test]
  async fn sourceless_recipe_gets_an_empty_workdir() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("work/src");
    prepare_source(
      &SourceSpec::default(),
      tmp.path(),
      &tmp.path().join("cache"),
      &dest,
    )
    .await
    .unwrap();
    assert!(dest.is_dir());
  }

  #[tokio::test]
  async fn missing_local_source_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = SourceSpec {
      path: Some(PathBuf::from("nowhere")),
      ..Default::default()
    };
    let err = prepare_source(&spec, tmp.path(), &tmp.path().join("c"), &tmp.path().join("d"))
      .await;
    assert!(matches!(err, Err(FetchError::MissingLocalSource { .. })));
  }
}
