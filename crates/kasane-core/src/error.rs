use std::path::PathBuf;
use thiserror::Error;

/// 定義ファイル・依存グラフ起因のエラー
///
/// すべてプラン構築の段階（Dockerデーモンに触れる前）に検出される。
/// 各バリアントは安定した終了コードを持ち、スクリプトから判別できる。
#[derive(Debug, Error)]
pub enum DefError {
    #[error(
        "イメージ \"{image}\" に FROM と FROM_DOCKERFILE が両方指定されています\n\nヒント:\n  • 外部ベースはどちらか一方だけ指定してください"
    )]
    MultipleBase { image: String },

    #[error(
        "外部ベースイメージが競合しています。\"{image}\" は次の両方に依存しています:\n  {image} (FROM: {base})\n  {other_image} (FROM: {other_base})"
    )]
    ConflictingBase {
        image: String,
        base: String,
        other_image: String,
        other_base: String,
    },

    #[error(
        "\"{image}\" の依存ツリーにベースイメージが見つかりません\n\nヒント:\n  • requires で辿れるいずれかのイメージに FROM か FROM_DOCKERFILE が必要です"
    )]
    NoBase { image: String },

    #[error("_SOURCES_ が循環しています: {}", path.display())]
    CircularSources { path: PathBuf },

    #[error("ファイル \"{}\" のイメージ \"{image}\" に未知のフィールド \"{field}\" があります", file.display())]
    UnrecognizedField {
        field: String,
        image: String,
        file: PathBuf,
    },

    #[error("requires が循環しています:\n  {cycle}")]
    CircularDependency { cycle: String },

    #[error("イメージ \"{image}\" の requires がリストではありません")]
    InvalidRequiresList { image: String },

    #[error("定義ファイルの読み込みに失敗しました: {message}")]
    ParsingFailure { message: String },

    #[error(
        "イメージ \"{image}\" に ignore と ignore_file が両方指定されています\n\nヒント:\n  • 除外指定はどちらか一方だけにしてください"
    )]
    MultipleIgnore { image: String },

    #[error("イメージ \"{name}\" が定義されていません（\"{referenced_by}\" から参照）")]
    UnknownComponent {
        name: String,
        referenced_by: String,
    },
}

impl DefError {
    /// プロセス終了コード。コードは互換性のため固定
    pub fn exit_code(&self) -> i32 {
        match self {
            DefError::MultipleBase { .. } => 40,
            DefError::ConflictingBase { .. } => 41,
            DefError::NoBase { .. } => 42,
            DefError::CircularSources { .. } => 43,
            DefError::UnrecognizedField { .. } => 44,
            DefError::CircularDependency { .. } => 45,
            DefError::InvalidRequiresList { .. } => 49,
            DefError::ParsingFailure { .. } => 50,
            DefError::MultipleIgnore { .. } => 51,
            DefError::UnknownComponent { .. } => 55,
        }
    }
}

pub type Result<T> = std::result::Result<T, DefError>;
