//! ステップエグゼキュータ
//!
//! コンパイル済みのビルドプランを順に実行する。copy_fromのソース
//! ターゲットを先に（セッション内で一度だけ）ビルドし、各ステップを
//! 中間タグで連鎖させ、最後に最終タグを付けて中間タグを掃除する。

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use colored::Colorize;
use kasane_core::{BuildTarget, ExternalDockerfile, LayerStep, Step};

use crate::context::create_context;
use crate::engine::{BuildOpts, Engine};
use crate::error::{BuildError, Result};
use crate::staging::StagedFile;

/// ビルド失敗時に命令を書き出す診断ファイル
pub const FAILURE_DUMP: &str = "kasane-failed.dockerfile";

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Dockerのレイヤーキャッシュを使う
    pub usecache: bool,
    /// ベースイメージを毎回pullし直す
    pub pull: bool,
    /// 中間イメージのタグを残す
    pub keep_build_tags: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            usecache: true,
            pull: false,
            keep_build_tags: false,
        }
    }
}

/// 1回の起動分のセッション状態
///
/// プロセスグローバルにはせず、エグゼキュータごとに持つ。
/// 同一プロセスで複数回実行しても状態が漏れない。
#[derive(Debug, Default)]
struct BuildSession {
    /// このセッションで既にビルドしたソースターゲット名
    updated_sources: HashSet<String>,
    /// 既にキャッシュバスト済みのビルドスタックのキー
    busted_stacks: HashSet<Vec<String>>,
    /// ビルド済みの外部Dockerfileのパス
    built_dockerfiles: HashSet<PathBuf>,
}

impl BuildSession {
    /// このステップでバストするか。同一スタックはセッション中1回で足りる
    fn should_bust(&self, requested: bool, key: &[String]) -> bool {
        requested && !self.busted_stacks.contains(key)
    }
}

pub struct Executor<'a> {
    engine: &'a Engine,
    opts: ExecuteOptions,
    session: BuildSession,
}

impl<'a> Executor<'a> {
    pub fn new(engine: &'a Engine, opts: ExecuteOptions) -> Self {
        Self {
            engine,
            opts,
            session: BuildSession::default(),
        }
    }

    /// ターゲットをビルドし、最終イメージ名を返す
    pub async fn execute(&mut self, target: &BuildTarget) -> Result<String> {
        self.update_source_images(target).await?;

        let Some(last) = target.steps.last() else {
            return Ok(target.target_name.clone());
        };

        println!();
        println!(
            "{} \"{}\" （定義 \"{}\"、{}）",
            "ビルド開始:".green().bold(),
            target.target_name,
            target.image_name,
            last.source_file().display()
        );

        let total = target.steps.len();
        for (istep, step) in target.steps.iter().enumerate() {
            println!(
                " * {} {}, Step {}/{}",
                "ビルド中:".blue(),
                step.image_name().bold(),
                istep + 1,
                total
            );

            let requested = matches!(step, Step::Layer(l) if l.bust_cache);
            let stack_key = stack_key(target, istep);
            let bust = self.session.should_bust(requested, &stack_key);

            match step {
                Step::Layer(layer) => self.build_layer(layer, bust).await?,
                Step::Copy(copy) => {
                    let staged =
                        StagedFile::new(&copy.source_image, &copy.source_path, &copy.dest_path);
                    staged.stage(self.engine, &copy.base_image, &copy.tag).await?;
                }
            }

            if bust {
                self.session.busted_stacks.insert(stack_key);
            }
            println!("   - 中間イメージ {} を作成しました", step.tag());
        }

        self.finalize(target, last.tag()).await?;
        println!(
            " {} {}",
            "***".green(),
            format!("イメージ {} をビルドしました", target.target_name).green()
        );
        Ok(target.target_name.clone())
    }

    /// copy_fromのソースターゲットを先にビルドする（セッション内で一度だけ）
    async fn update_source_images(&mut self, target: &BuildTarget) -> Result<()> {
        for build in &target.source_builds {
            if self.session.updated_sources.contains(&build.target_name) {
                continue;
            }
            println!(
                "{} {}",
                "ソースイメージを更新中:".cyan(),
                build.target_name
            );
            self.execute_boxed(build).await?;
            self.session
                .updated_sources
                .insert(build.target_name.clone());
        }
        Ok(())
    }

    /// 再帰用。具象Future型の無限再帰をdynで断ち切る
    fn execute_boxed<'b>(
        &'b mut self,
        target: &'b BuildTarget,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + 'b>> {
        Box::pin(self.execute(target))
    }

    async fn build_layer(&mut self, step: &LayerStep, bust: bool) -> Result<()> {
        if let Some(dockerfile) = &step.build_first {
            self.build_external_dockerfile(dockerfile).await?;
        }

        let usecache = self.opts.usecache && !bust;
        if !usecache {
            println!(
                "  {}",
                "キャッシュ無効 - このステップはゼロから再ビルドされます".yellow()
            );
        }

        let cache_from = if usecache {
            self.resolve_cache_from(step.cache_from.as_deref()).await
        } else {
            Vec::new()
        };

        let instructions = step.render();
        let context = create_context(
            &instructions,
            step.build_directory.as_deref(),
            step.exclude.as_deref(),
        )?;
        if let Some(dir) = &step.build_directory {
            println!("  {} {}", "ビルドコンテキスト:".blue(), dir.display());
        }

        let opts = BuildOpts {
            tag: step.tag.clone(),
            nocache: !usecache,
            pull: self.opts.pull,
            squash: step.squash,
            cache_from,
            ..Default::default()
        };

        if let Err(err) = self.engine.build(context, &opts).await {
            if step.squash && !self.engine.is_experimental().await {
                return Err(BuildError::ExperimentalRequired);
            }
            return Err(self.dump_failure(step, &instructions, err));
        }

        if step.squash && !bust {
            crate::squash::resolve_squash_cache(self.engine, &step.tag).await?;
        }

        Ok(())
    }

    /// 失敗した命令を診断ファイルに書き出して型付きエラーにする
    fn dump_failure(&self, step: &LayerStep, instructions: &str, err: BuildError) -> BuildError {
        let diagnostics = PathBuf::from(FAILURE_DUMP);
        let dump = format!(
            "# step: {}\n# source: {}\n# error: {}\n{}\n",
            step.image_name,
            step.source_file.display(),
            err,
            instructions
        );
        if let Err(write_err) = std::fs::write(&diagnostics, dump) {
            tracing::warn!("診断ファイルを書き出せませんでした: {}", write_err);
        }
        BuildError::BuildFailed {
            step: step.image_name.clone(),
            message: err.to_string(),
            diagnostics,
        }
    }

    /// 外部Dockerfileをビルドする。セッション内でパスごとに一度だけ
    async fn build_external_dockerfile(&mut self, dockerfile: &ExternalDockerfile) -> Result<()> {
        if self.session.built_dockerfiles.contains(&dockerfile.path) {
            return Ok(());
        }
        println!(
            "  {} {}",
            "ベースイメージをビルド中:".blue(),
            dockerfile.path.display()
        );

        let instructions = std::fs::read_to_string(&dockerfile.path).map_err(|e| {
            BuildError::ExternalBuild {
                path: dockerfile.path.clone(),
                message: e.to_string(),
            }
        })?;
        let context_dir = dockerfile.path.parent();
        let context = create_context(&instructions, context_dir, None)?;

        let opts = BuildOpts {
            tag: dockerfile.tag.clone(),
            ..Default::default()
        };
        self.engine
            .build(context, &opts)
            .await
            .map_err(|e| BuildError::ExternalBuild {
                path: dockerfile.path.clone(),
                message: e.to_string(),
            })?;

        println!(
            "  {} {}",
            "ビルド完了:".green(),
            dockerfile.path.display()
        );
        self.session
            .built_dockerfiles
            .insert(dockerfile.path.clone());
        Ok(())
    }

    /// cache-from候補を解決する。手元に無ければpullを試し、
    /// 取れないものは警告して落とす
    async fn resolve_cache_from(&self, candidates: Option<&[String]>) -> Vec<String> {
        let mut resolved = Vec::new();
        for name in candidates.unwrap_or(&[]) {
            match self.engine.image_exists(name).await {
                Ok(true) => resolved.push(name.clone()),
                _ => match self.engine.pull(name).await {
                    Ok(()) => resolved.push(name.clone()),
                    Err(e) => {
                        println!(
                            "  {}",
                            format!("キャッシュイメージ {} を取得できません: {}", name, e)
                                .yellow()
                        );
                    }
                },
            }
        }
        resolved
    }

    /// 最終タグを付け、中間タグを掃除する
    async fn finalize(&self, target: &BuildTarget, final_image: &str) -> Result<()> {
        self.engine.tag(final_image, &target.target_name).await?;
        println!(
            "{} {}",
            "最終イメージをタグ付けしました:".green(),
            target.target_name
        );

        if !self.opts.keep_build_tags {
            for step in &target.steps {
                if let Err(e) = self.engine.remove_image(step.tag()).await {
                    tracing::warn!("中間タグ {} を削除できませんでした: {}", step.tag(), e);
                }
            }
        }
        Ok(())
    }
}

/// バスト抑制用のスタックキー
///
/// 外部ベース + そこまでのレイヤーステップのイメージ名のタプル。
/// コピー用ステップはスタックの同一性に寄与しない。
fn stack_key(target: &BuildTarget, istep: usize) -> Vec<String> {
    let mut names = vec![target.external_base.to_string()];
    for step in &target.steps[..=istep] {
        if let Step::Layer(layer) = step {
            names.push(layer.image_name.clone());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasane_core::{ImageDefs, PlanOptions};

    fn plan_from(yaml: &str, image: &str) -> (tempfile::TempDir, BuildTarget) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kasane.yml");
        std::fs::write(&path, yaml).unwrap();
        let mut defs = ImageDefs::load(&path).unwrap();
        let target = defs
            .generate_build(image, image, &[], &PlanOptions::default())
            .unwrap();
        (dir, target)
    }

    #[test]
    fn test_stack_key_skips_copy_steps() {
        let (_dir, target) = plan_from(
            r#"
base:
  FROM: x
tool:
  requires: [base]
  build: RUN make
app:
  requires: [base]
  copy_from:
    tool:
      /usr/bin/tool: /opt
"#,
            "app",
        );
        // steps: base(layer), app(layer), copy
        assert_eq!(target.steps.len(), 3);
        let key_through_copy = stack_key(&target, 2);
        let key_through_app = stack_key(&target, 1);
        assert_eq!(key_through_copy, key_through_app);
        assert_eq!(key_through_app, vec!["x", "base", "app"]);
    }

    #[test]
    fn test_bust_happens_once_per_stack_per_session() {
        let mut session = BuildSession::default();
        let key = vec!["x".to_string(), "base".to_string(), "app".to_string()];

        // 1回目はバストする
        assert!(session.should_bust(true, &key));
        session.busted_stacks.insert(key.clone());

        // 同一スタックの2回目は抑制される
        assert!(!session.should_bust(true, &key));

        // バスト指定のないステップはそもそもバストしない
        assert!(!session.should_bust(false, &key));

        // 別のスタックキーは独立に扱われる
        let other = vec!["x".to_string(), "base".to_string()];
        assert!(session.should_bust(true, &other));
    }

    #[test]
    fn test_stack_key_grows_per_layer() {
        let (_dir, target) = plan_from(
            r#"
base:
  FROM: x
app:
  requires: [base]
  build: RUN true
"#,
            "app",
        );
        assert_eq!(stack_key(&target, 0), vec!["x", "base"]);
        assert_eq!(stack_key(&target, 1), vec!["x", "base", "app"]);
    }
}
