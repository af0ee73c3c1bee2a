//! ビルドプランのコンパイル
//!
//! ソート済みの依存列を、中間イメージ名で連鎖したステップ列に変換する。
//! `copy_from` は所有イメージのステップ直後にコピー用ステップを差し込み、
//! ソースイメージのプランをネストしてぶら下げる。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::defs::ImageDefs;
use crate::error::{DefError, Result};
use crate::graph::{ExternalBase, ExternalDockerfile};
use crate::naming::generate_name;

/// 1レイヤーを生成するビルドステップ
#[derive(Debug, Clone)]
pub struct LayerStep {
    /// このステップを宣言したイメージ定義の名前
    pub image_name: String,
    /// `FROM` に使うイメージ（直前のステップの出力か外部ベース）
    pub base_image: String,
    /// 定義の `build` ブロック（そのまま埋め込む。解釈はしない）
    pub build: Option<String>,
    /// このステップの出力に付ける中間タグ
    pub tag: String,
    pub build_directory: Option<PathBuf>,
    /// ビルドコンテキストの除外パターン
    pub exclude: Option<Vec<String>>,
    /// このステップでDockerのレイヤーキャッシュを無効化するか
    pub bust_cache: bool,
    /// レイヤーキャッシュのシードに使う候補イメージ
    pub cache_from: Option<Vec<String>>,
    /// 最初のステップの前にビルドが必要な外部Dockerfile
    pub build_first: Option<Arc<ExternalDockerfile>>,
    pub squash: bool,
    /// squash前に消しておくシークレットファイル
    pub secret_files: Vec<String>,
    pub source_file: PathBuf,
}

impl LayerStep {
    pub fn dockerfile_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("FROM {}\n", self.base_image)];
        if self.squash {
            lines.push("# This step should be built with --squash".to_string());
        }
        if !self.secret_files.is_empty() {
            let files = self.secret_files.join(" ");
            lines.push(format!(
                "RUN for file in {files}; do if [ -e $file ]; then \
                 echo \"ERROR: Secret file $file already exists.\"; exit 1; fi; done;"
            ));
        }
        lines.push(self.build.clone().unwrap_or_default());
        if !self.secret_files.is_empty() {
            lines.push(format!("RUN rm -rf {}", self.secret_files.join(" ")));
        }
        lines
    }

    /// レンダリング済みのDockerfile本文
    pub fn render(&self) -> String {
        self.dockerfile_lines().join("\n")
    }
}

/// 別イメージからファイルをコピーするステップ
///
/// レイヤーはビルドエンジン直接ではなくステージングエンジンで作られる。
#[derive(Debug, Clone)]
pub struct FileCopyStep {
    pub source_image: String,
    pub source_path: String,
    pub dest_path: String,
    pub image_name: String,
    pub base_image: String,
    pub tag: String,
    pub cache_from: Option<Vec<String>>,
    pub source_file: PathBuf,
}

impl FileCopyStep {
    /// Dockerfile出力専用。ビルドには使わない
    pub fn dockerfile_lines(&self) -> Vec<String> {
        let basename = Path::new(&self.source_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_path.clone());
        vec![
            format!("FROM {}\n", self.base_image),
            format!(
                "# Warning: the file \"{}\" from the image \"{}\" must be present in this build context!!",
                self.source_path, self.source_image
            ),
            format!("ADD {} {}", basename, self.dest_path),
            String::new(),
        ]
    }
}

/// プラン内の1ステップ。バリアントは固定なのでenumで閉じる
#[derive(Debug, Clone)]
pub enum Step {
    Layer(LayerStep),
    Copy(FileCopyStep),
}

impl Step {
    pub fn tag(&self) -> &str {
        match self {
            Step::Layer(s) => &s.tag,
            Step::Copy(s) => &s.tag,
        }
    }

    pub fn image_name(&self) -> &str {
        match self {
            Step::Layer(s) => &s.image_name,
            Step::Copy(s) => &s.image_name,
        }
    }

    pub fn base_image(&self) -> &str {
        match self {
            Step::Layer(s) => &s.base_image,
            Step::Copy(s) => &s.base_image,
        }
    }

    pub fn source_file(&self) -> &Path {
        match self {
            Step::Layer(s) => &s.source_file,
            Step::Copy(s) => &s.source_file,
        }
    }

    pub fn dockerfile_lines(&self) -> Vec<String> {
        match self {
            Step::Layer(s) => s.dockerfile_lines(),
            Step::Copy(s) => s.dockerfile_lines(),
        }
    }
}

/// プラン構築のオプション
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// 最終レイヤーをsquashする
    pub squash: bool,
    /// squash前に消すファイル（指定時はsquash必須）
    pub secret_files: Vec<String>,
    /// キャッシュシード用イメージのリポジトリ
    pub cache_repo: Option<String>,
    /// キャッシュシード用イメージのタグ
    pub cache_tag: Option<String>,
}

/// 1ターゲット分のコンパイル済みビルドプラン
#[derive(Debug, Clone)]
pub struct BuildTarget {
    /// 定義ファイル上のイメージ名
    pub image_name: String,
    /// 最終イメージに付ける名前
    pub target_name: String,
    pub steps: Vec<Step>,
    /// `copy_from` のソースとして先にビルドが必要なプラン
    pub source_builds: Vec<BuildTarget>,
    pub external_base: ExternalBase,
}

impl BuildTarget {
    /// プラン全体を1枚のDockerfileとして書き出す
    ///
    /// 2ステップ目以降は先頭の `FROM` 行を落として連結する。
    pub fn write_dockerfile(&self, output_dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let mut lines = Vec::new();
        for (istep, step) in self.steps.iter().enumerate() {
            let step_lines = step.dockerfile_lines();
            let skip = if istep == 0 { 0 } else { 1 };
            lines.extend(step_lines.into_iter().skip(skip));
        }

        let path = output_dir.join(format!("Dockerfile.{}", self.image_name));
        std::fs::write(&path, lines.join("\n"))?;
        Ok(path)
    }

    /// コピー元イメージを含む、自分の直前にビルドすべきターゲット名
    pub fn source_names(&self) -> Vec<&str> {
        self.source_builds
            .iter()
            .map(|b| b.target_name.as_str())
            .collect()
    }
}

impl ImageDefs {
    /// ターゲットのビルドプランをコンパイルする
    ///
    /// 構造エラー（巡回、ベース競合、フィールド不正）はすべてここまでに
    /// 検出され、エンジンには一切触れない。
    pub fn generate_build(
        &mut self,
        image: &str,
        target_name: &str,
        rebuilds: &[String],
        opts: &PlanOptions,
    ) -> Result<BuildTarget> {
        let external_base =
            self.resolve_external_base(image)?
                .ok_or_else(|| DefError::NoBase {
                    image: image.to_string(),
                })?;

        let cache_from = if opts.cache_repo.is_some() || opts.cache_tag.is_some() {
            Some(vec![generate_name(
                image,
                opts.cache_repo.as_deref(),
                opts.cache_tag.as_deref(),
            )])
        } else {
            None
        };

        let rebuilds: HashSet<&str> = rebuilds.iter().map(String::as_str).collect();

        let mut steps: Vec<Step> = Vec::new();
        let mut source_images: Vec<String> = Vec::new();
        let mut base_image = external_base.tag().to_string();
        let mut build_first = match &external_base {
            ExternalBase::Dockerfile(df) => Some(df.clone()),
            ExternalBase::Image(_) => None,
        };
        let mut istep = 0;

        for name in self.sort_dependencies(image)? {
            let def = self.def(&name, None)?.clone();
            istep += 1;
            let tag = format!("ksn_build_{image}_{istep}");

            // `build` が無い抽象イメージも集約点として空ステップを持つ
            steps.push(Step::Layer(LayerStep {
                image_name: name.clone(),
                base_image: base_image.clone(),
                build: def.build.clone(),
                tag: tag.clone(),
                build_directory: def.build_directory.clone(),
                exclude: def.exclude_patterns()?,
                bust_cache: rebuilds.contains(name.as_str()),
                cache_from: cache_from.clone(),
                build_first: build_first.take(),
                squash: false,
                secret_files: Vec::new(),
                source_file: def.source_file.clone(),
            }));
            base_image = tag;

            for spec in def.copy_specs() {
                if !source_images.contains(&spec.source_image) {
                    source_images.push(spec.source_image.clone());
                }
                for (source_path, dest_path) in &spec.files {
                    istep += 1;
                    let tag = format!("ksn_build_{image}_{istep}");
                    steps.push(Step::Copy(FileCopyStep {
                        source_image: spec.source_image.clone(),
                        source_path: source_path.clone(),
                        dest_path: dest_path.clone(),
                        image_name: name.clone(),
                        base_image: base_image.clone(),
                        tag: tag.clone(),
                        cache_from: cache_from.clone(),
                        source_file: def.source_file.clone(),
                    }));
                    base_image = tag;
                }
            }
        }

        if opts.squash {
            if let Some(Step::Layer(last)) = steps
                .iter_mut()
                .rev()
                .find(|s| matches!(s, Step::Layer(_)))
            {
                last.squash = true;
                last.secret_files = opts.secret_files.clone();
            }
        }

        // コピー元イメージは自身の名前でビルドしておく。
        // squashはトップレベルのターゲットにだけ適用する
        let source_opts = PlanOptions {
            squash: false,
            secret_files: Vec::new(),
            cache_repo: opts.cache_repo.clone(),
            cache_tag: opts.cache_tag.clone(),
        };
        let source_builds = source_images
            .into_iter()
            .map(|img| self.generate_build(&img, &img, &[], &source_opts))
            .collect::<Result<Vec<_>>>()?;

        Ok(BuildTarget {
            image_name: image.to_string(),
            target_name: target_name.to_string(),
            steps,
            source_builds,
            external_base,
        })
    }
}
