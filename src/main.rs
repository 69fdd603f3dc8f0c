use std::process::ExitCode;

mod app;
mod config;
mod connection;
mod discovery;
mod document;
mod messages;
mod panel;
mod rate;
mod session;
mod store;

#[tokio::main]
async fn main() -> ExitCode {
    let result = app::start().await;
    match result {
        Ok(..) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
