use std::process::ExitCode;

mod app;

#[tokio::main]
async fn main() -> ExitCode {
    match app::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", app::error_chain(&err));
            ExitCode::FAILURE
        }
    }
}
