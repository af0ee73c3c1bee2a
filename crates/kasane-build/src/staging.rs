//! ステージングエンジン
//!
//! ビルド済みイメージからファイルを取り出し、別イメージのビルド
//! コンテキストに継ぎ足す。取り出したアーカイブは
//! (ソースイメージのダイジェスト, パス) をキーにディスクにキャッシュする。
//!
//! キャッシュディレクトリは複数プロセスで共有される。書き込みは
//! 一時ディレクトリからのrenameで行うので壊れることはないが、
//! 同じキーを同時に作ると後勝ちになる（ロックはしない）。

use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::context::create_context;
use crate::engine::{BuildOpts, Engine};
use crate::error::Result;

/// キャッシュのルート（`~/.cache/kasane` 相当）
pub fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kasane")
}

fn copy_cache_dir() -> PathBuf {
    cache_root().join("copy-cache")
}

pub(crate) fn copy_tmp_dir() -> PathBuf {
    cache_root().join("copy-tmp")
}

/// `--clear-copy-cache` の実体。削除したパスを返す
pub fn clear_copy_cache() -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dir in [copy_cache_dir(), copy_tmp_dir(), cache_root().join("squashes")] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            removed.push(dir);
        }
    }
    Ok(removed)
}

/// あるイメージでビルドされ、別イメージへコピーされるファイル
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub source_image: String,
    pub source_path: String,
    pub dest_path: String,
}

impl StagedFile {
    pub fn new(source_image: &str, source_path: &str, dest_path: &str) -> Self {
        Self {
            source_image: source_image.to_string(),
            source_path: source_path.to_string(),
            dest_path: dest_path.to_string(),
        }
    }

    /// `start_image` にファイルを継ぎ足した `new_image` を作る
    pub async fn stage(&self, engine: &Engine, start_image: &str, new_image: &str) -> Result<()> {
        println!(
            " * {} \"{}:{}\" {} \"{}:{}\"",
            "コピー".blue(),
            self.source_image,
            self.source_path,
            "→".blue(),
            start_image,
            self.dest_path
        );

        let cache_dir = self.ensure_cached(engine).await?;

        let dockerfile = format!(
            "FROM {}\nADD content.tar {}",
            start_image, self.dest_path
        );
        let context = create_context(&dockerfile, Some(&cache_dir), None)?;
        engine
            .build(
                context,
                &BuildOpts {
                    tag: new_image.to_string(),
                    ..Default::default()
                },
            )
            .await
    }

    /// (ダイジェスト, マングルしたパス) をキーにしたキャッシュディレクトリ
    fn cache_entry_dir(&self, digest: &str) -> PathBuf {
        copy_cache_dir()
            .join(digest)
            .join(self.source_path.replace('/', "_-"))
    }

    /// キャッシュエントリを返す。無ければソースイメージから取り出して作る
    async fn ensure_cached(&self, engine: &Engine) -> Result<PathBuf> {
        // ソースイメージが変わればダイジェストが変わり、自動的に無効化される
        let digest = engine.image_digest(&self.source_image).await?;
        let cache_dir = self.cache_entry_dir(&digest);
        let payload = cache_dir.join("content.tar");

        if probe_cache(&cache_dir)? {
            println!("   {} {}", "キャッシュを使用:".blue(), cache_dir.display());
            return Ok(cache_dir);
        }

        println!("   {} {}", "キャッシュを作成:".blue(), cache_dir.display());

        let tmp_root = copy_tmp_dir();
        std::fs::create_dir_all(&tmp_root)?;
        let tmp = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&tmp_root)?;
        engine
            .export_path(
                &self.source_image,
                &self.source_path,
                &tmp.path().join("content.tar"),
            )
            .await?;

        if let Some(parent) = cache_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp.keep();
        if let Err(e) = std::fs::rename(&tmp_path, &cache_dir) {
            // 併走する別プロセスが先に同じキーを作った場合はそれを使う
            if payload.exists() {
                let _ = std::fs::remove_dir_all(&tmp_path);
            } else {
                return Err(e.into());
            }
        }
        Ok(cache_dir)
    }
}

/// キャッシュエントリが使えるか調べる
///
/// ディレクトリはあるのにアーカイブ本体が無い（外部干渉で消された）
/// エントリは、ここで削除して「無し」として報告する。
fn probe_cache(cache_dir: &Path) -> std::io::Result<bool> {
    if !cache_dir.exists() {
        return Ok(false);
    }
    if cache_dir.join("content.tar").exists() {
        return Ok(true);
    }
    tracing::warn!(
        "キャッシュ {} が不完全なため作り直します",
        cache_dir.display()
    );
    std::fs::remove_dir_all(cache_dir)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_entry_dir_keyed_by_digest_then_mangled_path() {
        let staged = StagedFile::new("tool", "/usr/bin/tool", "/opt");
        let dir = staged.cache_entry_dir("abc123");
        assert!(
            dir.ends_with("copy-cache/abc123/_-usr_-bin_-tool"),
            "got {dir:?}"
        );
    }

    #[test]
    fn test_probe_cache_hits_only_with_payload() {
        let root = tempfile::tempdir().unwrap();
        let entry = root.path().join("abc123/_-usr_-bin_-tool");

        // 未作成のエントリはミス
        assert!(!probe_cache(&entry).unwrap());

        // アーカイブ本体があればヒット
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("content.tar"), b"tar").unwrap();
        assert!(probe_cache(&entry).unwrap());
    }

    #[test]
    fn test_probe_cache_invalidates_incomplete_entry() {
        let root = tempfile::tempdir().unwrap();
        let entry = root.path().join("abc123/_-usr_-bin_-tool");
        std::fs::create_dir_all(&entry).unwrap();

        // content.tarの無いエントリは削除されてミスになる
        assert!(!probe_cache(&entry).unwrap());
        assert!(!entry.exists());
    }
}
