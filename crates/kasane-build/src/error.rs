use std::path::PathBuf;
use thiserror::Error;

/// ビルド実行時のエラー
///
/// 構造エラーは [`kasane_core::DefError`] としてプラン構築時に出る。
/// こちらはエンジン呼び出し以降の失敗を表し、同じく安定した終了コードを持つ。
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(
        "Dockerに接続できません: {0}\n\nヒント:\n  • Dockerデーモンが起動しているか確認してください\n  • DOCKER_HOST の設定を確認してください"
    )]
    DockerConnectionFailed(String),

    #[error("Docker APIエラー: {0}")]
    DockerApi(String),

    #[error(
        "ステップ \"{step}\" のビルドに失敗しました: {message}\n  失敗した命令は {} に書き出しました", diagnostics.display()
    )]
    BuildFailed {
        step: String,
        message: String,
        diagnostics: PathBuf,
    },

    #[error(
        "外部Dockerfile {} のビルドに失敗しました: {message}\n\nヒント:\n  • Dockerfileの内容に誤りがないか確認してください", path.display()
    )]
    ExternalBuild { path: PathBuf, message: String },

    #[error("ファイル \"{path}\" がイメージ \"{image}\" に存在しません")]
    MissingFile { path: String, image: String },

    #[error(
        "--squash には experimental モードのDockerデーモンが必要です\n\nヒント:\n  • /etc/docker/daemon.json に {{\"experimental\": true}} を設定してください"
    )]
    ExperimentalRequired,

    #[error("プッシュに失敗しました: {message}")]
    PushFailed { message: String },

    #[error(
        "プッシュ先のレジストリが指定されていません\n\nヒント:\n  • --repository でレジストリURLを含むリポジトリを指定してください"
    )]
    NoRegistry,

    #[error(transparent)]
    Def(#[from] kasane_core::DefError),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for BuildError {
    fn from(err: bollard::errors::Error) -> Self {
        let message = err.to_string();
        if message.contains("Connection refused") || message.contains("No such file or directory")
        {
            BuildError::DockerConnectionFailed(message)
        } else {
            BuildError::DockerApi(message)
        }
    }
}

impl BuildError {
    /// プロセス終了コード。コードは互換性のため固定
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::NoRegistry => 46,
            BuildError::MissingFile { .. } => 47,
            BuildError::ExternalBuild { .. } => 48,
            BuildError::BuildFailed { .. } => 52,
            BuildError::ExperimentalRequired => 53,
            BuildError::PushFailed { .. } => 54,
            BuildError::Def(e) => e.exit_code(),
            BuildError::DockerConnectionFailed(_)
            | BuildError::DockerApi(_)
            | BuildError::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
