use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    stepwise_cli::run().await
}
