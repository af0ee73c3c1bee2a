mod cli;
mod run;

use clap::Parser;
use colored::Colorize;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // ログはstderrに出す。標準出力はビルドの進捗表示に使う
    tracing_subscriber::fmt::init();

    if let Err(err) = run::run(cli).await {
        eprintln!("{} {:#}", "エラー:".red().bold(), err);
        std::process::exit(exit_code(&err));
    }
}

/// エラーチェーンから安定した終了コードを引く
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<kasane_core::DefError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<kasane_build::BuildError>() {
            return e.exit_code();
        }
    }
    1
}
