use clap::Parser;

use pg_shuttle::cli::{self, Cli};
use pg_shuttle::summary::RunStatus;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli::init_tracing(cli.log_json);

    let code = match cli::run(cli).await {
        Ok(RunStatus::Success) => 0,
        Ok(RunStatus::Failed) => 1,
        Err(e) => {
            tracing::error!(kind = %e.kind(), error = %e, "run failed");
            eprintln!("pgshuttle: [{}] {e}", e.kind());
            1
        }
    };
    std::process::exit(code);
}
