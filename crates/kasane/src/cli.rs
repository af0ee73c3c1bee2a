use clap::Parser;
use std::path::PathBuf;

/// 重ねる。継ぐ。Dockerfileは、部品になった。
///
/// 定義ファイル（kasane.yml）のイメージ部品を `requires` で合成し、
/// 1本のレイヤー列としてビルドします。
#[derive(Debug, Parser)]
#[command(name = "kasane", version, about = "重ねる。継ぐ。Dockerfileは、部品になった。", long_about = None)]
pub struct Cli {
    /// ビルドするターゲット（定義ファイル内のイメージ名）
    pub targets: Vec<String>,

    /// 定義ファイルのパス
    #[arg(short = 'f', long = "makefile", default_value = "kasane.yml")]
    pub makefile: PathBuf,

    /// 全ターゲット（_ALL_ があればその内容）をビルドする
    #[arg(short, long, conflicts_with = "targets")]
    pub all: bool,

    /// 定義済みターゲットを一覧表示して終了
    #[arg(short, long)]
    pub list: bool,

    /// アドホックターゲットが要求するイメージ（--name が必要）
    #[arg(long, num_args = 1.., requires = "name")]
    pub requires: Vec<String>,

    /// アドホックターゲットの名前（--requires が必要）
    #[arg(long, requires = "requires")]
    pub name: Option<String>,

    /// 生成したDockerfileを `Dockerfile.[image]` として書き出す
    #[arg(short = 'p', long = "print-dockerfiles")]
    pub print_dockerfiles: bool,

    /// Dockerfileの出力先ディレクトリ
    #[arg(long = "dockerfile-dir", default_value = "kasane_dockerfiles")]
    pub dockerfile_dir: PathBuf,

    /// Dockerfileを生成するだけでビルドしない（--print-dockerfiles を含む）
    #[arg(short = 'n', long = "no-build")]
    pub no_build: bool,

    /// FROMイメージを毎回pullし直す
    #[arg(long)]
    pub pull: bool,

    /// レイヤーキャッシュを使わず全部再ビルドする
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// 指定イメージのレイヤーを強制的に再ビルドする（複数回指定可）
    #[arg(long = "bust-cache")]
    pub bust_cache: Vec<String>,

    /// レイヤーキャッシュのシードを取得するリポジトリ
    #[arg(long = "cache-repo")]
    pub cache_repo: Option<String>,

    /// キャッシュシードに使うタグ
    #[arg(long = "cache-tag")]
    pub cache_tag: Option<String>,

    /// ビルドした全イメージに付けるリポジトリ接頭辞
    /// （末尾が ':' ならイメージ名はタグとして連結される）
    #[arg(short = 'r', long)]
    pub repository: Option<String>,

    /// ビルドした全イメージに付けるタグ
    #[arg(short = 't', long)]
    pub tag: Option<String>,

    /// ビルド後にレジストリへプッシュする（--repository が必要）
    #[arg(short = 'P', long = "push")]
    pub push: bool,

    /// 中間イメージのタグを残す
    #[arg(long = "keep-build-tags")]
    pub keep_build_tags: bool,

    /// 最終レイヤーをsquashする（experimentalデーモンが必要）
    #[arg(long)]
    pub squash: bool,

    /// squash前に削除するシークレットファイル（--squash を含む、複数回指定可）
    #[arg(long = "secret-file")]
    pub secret_files: Vec<String>,

    /// copy_from用のローカルキャッシュを削除して終了
    #[arg(long = "clear-copy-cache")]
    pub clear_copy_cache: bool,
}
